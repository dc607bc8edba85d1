//! SQLite storage bootstrap, schema migrations and shared connection handle.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the ledger core.
//! - Apply schema migrations in deterministic order.
//! - Retry transient busy/locked failures with bounded backoff.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Core code must not read/write ledger data before migrations succeed.
//! - A shared connection is only locked for one operation or batch at a time.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;

pub mod migrations;
mod open;
mod retry;

pub use open::{open_db, open_db_in_memory};
pub use retry::{is_busy_or_locked, with_io_retry, IoRetryPolicy};

pub type DbResult<T> = Result<T, DbError>;

/// Connection shared by the foreground command path and background workers.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wraps an opened connection for cross-thread use.
pub fn share(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
}

impl DbError {
    /// Returns whether this error is a transient lock contention failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(err) => is_busy_or_locked(err),
            Self::UnsupportedSchemaVersion { .. } => false,
        }
    }
}
