//! Append-only event log.
//!
//! # Responsibility
//! - Persist events per stream with optimistic concurrency control.
//! - Provide a global, gap-free-in-order read path for projections.
//! - Hold optional replay snapshots.
//!
//! # Invariants
//! - Stream versions are strictly monotonic; a stream is never rewritten.
//! - A rejected append leaves the stream byte-for-byte unchanged.
//! - The store performs no business validation.

mod event_store;

pub use event_store::SqliteEventStore;

use crate::db::DbError;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Concurrency expectation passed to [`SqliteEventStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Creation sentinel: the stream must not exist yet.
    NoStream,
    /// The stream must currently be at exactly this version.
    Exact(u64),
}

impl Display for ExpectedVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoStream => write!(f, "no-stream"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// One event to be appended; payload is serialized JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: String,
}

/// One persisted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub stream_id: String,
    pub aggregate_type: String,
    /// 1-based position within the stream.
    pub sequence_number: u64,
    pub event_type: String,
    pub payload: String,
    /// Unix epoch milliseconds.
    pub occurred_at: i64,
    /// Monotonic position across all streams.
    pub global_position: u64,
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub stream_id: String,
    /// Stream version after the append.
    pub version: u64,
    pub first_position: u64,
    pub last_position: u64,
}

/// Materialized aggregate state at a stream version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub stream_id: String,
    pub version: u64,
    pub state: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("concurrency conflict on stream `{stream_id}`: expected version {expected}, actual {}", display_actual(.actual))]
    ConcurrencyConflict {
        stream_id: String,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },
    #[error("append to stream `{0}` contains no events")]
    EmptyAppend(String),
    #[error("stream `{stream_id}` belongs to aggregate type `{actual}`, not `{expected}`")]
    AggregateTypeMismatch {
        stream_id: String,
        expected: String,
        actual: String,
    },
    #[error("snapshot for stream `{stream_id}` at version {version} is ahead of stream version {stream_version}")]
    SnapshotAhead {
        stream_id: String,
        version: u64,
        stream_version: u64,
    },
    #[error("failed to decode event {sequence_number} of stream `{stream_id}`: {message}")]
    Deserialization {
        stream_id: String,
        sequence_number: u64,
        message: String,
    },
    #[error("failed to encode event payload: {0}")]
    Serialization(String),
    #[error("invalid persisted event data: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Db(#[from] DbError),
}

fn display_actual(actual: &Option<u64>) -> String {
    actual.map_or_else(|| "none".to_string(), |version| version.to_string())
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Db(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
