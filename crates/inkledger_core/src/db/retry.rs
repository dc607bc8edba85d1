//! Bounded retry for transient SQLite contention.
//!
//! `SQLITE_BUSY` / `SQLITE_LOCKED` are the only failures retried here.
//! Concurrency conflicts on the event log are never retried at this layer.

use log::warn;
use std::time::Duration;

/// Attempt budget and linear backoff base for transient storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for IoRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(20),
        }
    }
}

/// Returns whether a rusqlite error is a busy/locked contention failure.
pub fn is_busy_or_locked(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. Backoff is `backoff * attempt`.
pub fn with_io_retry<T, E>(
    policy: IoRetryPolicy,
    operation: &'static str,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                warn!(
                    "event=io_retry module=db status=retry operation={} attempt={} max_attempts={}",
                    operation, attempt, max_attempts
                );
                std::thread::sleep(policy.backoff * attempt);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
