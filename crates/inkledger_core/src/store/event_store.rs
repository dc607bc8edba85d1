//! SQLite-backed event store.
//!
//! # Responsibility
//! - Append events atomically behind an expected-version check.
//! - Load per-stream history and read the global log for projections.
//! - Save and load replay snapshots.
//!
//! # Invariants
//! - Version check, stream row update and event inserts share one
//!   `IMMEDIATE` transaction; a failed check rolls everything back.
//! - `global_position` is assigned by SQLite `AUTOINCREMENT` and is never reused.

use super::{
    AppendOutcome, ExpectedVersion, NewEvent, Snapshot, StoreError, StoreResult, StoredEvent,
};
use crate::db::{with_io_retry, IoRetryPolicy};
use crate::model::now_epoch_ms;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

const EVENT_SELECT_SQL: &str = "SELECT
    global_position,
    stream_id,
    aggregate_type,
    sequence_number,
    event_type,
    payload,
    occurred_at
FROM events";

/// Event store over a migrated connection.
pub struct SqliteEventStore<'conn> {
    conn: &'conn Connection,
    retry: IoRetryPolicy,
}

impl<'conn> SqliteEventStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            retry: IoRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(conn: &'conn Connection, retry: IoRetryPolicy) -> Self {
        Self { conn, retry }
    }

    /// Appends `events` to `stream_id` if the stream is at `expected`.
    ///
    /// # Errors
    /// - `ConcurrencyConflict` when the stream version differs from `expected`.
    /// - `AggregateTypeMismatch` when the stream exists under another type.
    /// - `EmptyAppend` when `events` is empty.
    pub fn append(
        &self,
        stream_id: &str,
        aggregate_type: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> StoreResult<AppendOutcome> {
        if events.is_empty() {
            return Err(StoreError::EmptyAppend(stream_id.to_string()));
        }

        let outcome = with_io_retry(
            self.retry,
            "event_append",
            StoreError::is_transient,
            || self.append_once(stream_id, aggregate_type, expected, events),
        );

        match &outcome {
            Ok(appended) => debug!(
                "event=event_append module=store status=ok stream_id={} count={} version={} last_position={}",
                stream_id,
                events.len(),
                appended.version,
                appended.last_position
            ),
            Err(StoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => debug!(
                "event=event_append module=store status=conflict stream_id={} expected={} actual={:?}",
                stream_id, expected, actual
            ),
            Err(err) => warn!(
                "event=event_append module=store status=error stream_id={} error={}",
                stream_id, err
            ),
        }
        outcome
    }

    fn append_once(
        &self,
        stream_id: &str,
        aggregate_type: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> StoreResult<AppendOutcome> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let current = load_stream_head(&tx, stream_id)?;

        let base_version = match (expected, &current) {
            (ExpectedVersion::NoStream, None) => 0,
            (ExpectedVersion::Exact(0), None) => 0,
            (ExpectedVersion::Exact(version), Some(head)) if head.version == version => {
                if head.aggregate_type != aggregate_type {
                    return Err(StoreError::AggregateTypeMismatch {
                        stream_id: stream_id.to_string(),
                        expected: aggregate_type.to_string(),
                        actual: head.aggregate_type.clone(),
                    });
                }
                version
            }
            (_, head) => {
                return Err(StoreError::ConcurrencyConflict {
                    stream_id: stream_id.to_string(),
                    expected,
                    actual: head.as_ref().map(|head| head.version),
                });
            }
        };

        let now = now_epoch_ms();
        let new_version = base_version + events.len() as u64;
        if current.is_none() {
            tx.execute(
                "INSERT INTO streams (stream_id, aggregate_type, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4);",
                params![stream_id, aggregate_type, new_version as i64, now],
            )?;
        } else {
            tx.execute(
                "UPDATE streams
                 SET version = ?2,
                     updated_at = ?3
                 WHERE stream_id = ?1;",
                params![stream_id, new_version as i64, now],
            )?;
        }

        let mut first_position = 0u64;
        let mut last_position = 0u64;
        {
            let mut insert = tx.prepare(
                "INSERT INTO events (
                    stream_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    payload,
                    occurred_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            )?;
            for (offset, event) in events.iter().enumerate() {
                let sequence_number = base_version + offset as u64 + 1;
                insert.execute(params![
                    stream_id,
                    aggregate_type,
                    sequence_number as i64,
                    event.event_type.as_str(),
                    event.payload.as_str(),
                    now,
                ])?;
                last_position = tx.last_insert_rowid() as u64;
                if offset == 0 {
                    first_position = last_position;
                }
            }
        }

        tx.commit()?;
        Ok(AppendOutcome {
            stream_id: stream_id.to_string(),
            version: new_version,
            first_position,
            last_position,
        })
    }

    /// Loads the stream in sequence order, optionally only events after
    /// `after_version` (e.g. a snapshot version).
    pub fn load(
        &self,
        stream_id: &str,
        after_version: Option<u64>,
    ) -> StoreResult<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVENT_SELECT_SQL}
             WHERE stream_id = ?1
               AND sequence_number > ?2
             ORDER BY sequence_number ASC;"
        ))?;
        let mut rows = stmt.query(params![stream_id, after_version.unwrap_or(0) as i64])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(parse_event_row(row)?);
        }
        Ok(events)
    }

    /// Reads up to `batch_size` events with `global_position > after_position`.
    ///
    /// Reserved for projections; command handlers load by stream.
    pub fn read_global(
        &self,
        after_position: u64,
        batch_size: usize,
    ) -> StoreResult<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVENT_SELECT_SQL}
             WHERE global_position > ?1
             ORDER BY global_position ASC
             LIMIT ?2;"
        ))?;
        let mut rows = stmt.query(params![after_position as i64, batch_size.max(1) as i64])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(parse_event_row(row)?);
        }
        Ok(events)
    }

    /// Returns the stream version, or `None` when the stream does not exist.
    pub fn current_version(&self, stream_id: &str) -> StoreResult<Option<u64>> {
        Ok(load_stream_head(self.conn, stream_id)?.map(|head| head.version))
    }

    /// Highest assigned global position, `0` for an empty log.
    pub fn head_position(&self) -> StoreResult<u64> {
        let head: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(global_position), 0) FROM events;",
            [],
            |row| row.get(0),
        )?;
        Ok(head as u64)
    }

    /// Stores or replaces the snapshot of a stream.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let stream_version = self.current_version(&snapshot.stream_id)?.unwrap_or(0);
        if snapshot.version == 0 || snapshot.version > stream_version {
            return Err(StoreError::SnapshotAhead {
                stream_id: snapshot.stream_id.clone(),
                version: snapshot.version,
                stream_version,
            });
        }

        with_io_retry(self.retry, "snapshot_save", StoreError::is_transient, || {
            self.conn.execute(
                "INSERT INTO snapshots (stream_id, version, state, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream_id) DO UPDATE SET
                    version = excluded.version,
                    state = excluded.state,
                    created_at = excluded.created_at;",
                params![
                    snapshot.stream_id.as_str(),
                    snapshot.version as i64,
                    snapshot.state.as_str(),
                    now_epoch_ms(),
                ],
            )?;
            Ok(())
        })
    }

    /// Loads a usable snapshot. Snapshots ahead of the stream are ignored.
    pub fn load_snapshot(&self, stream_id: &str) -> StoreResult<Option<Snapshot>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT version, state FROM snapshots WHERE stream_id = ?1;",
                [stream_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((version, state)) = row else {
            return Ok(None);
        };

        let version = version as u64;
        let stream_version = self.current_version(stream_id)?.unwrap_or(0);
        if version > stream_version {
            warn!(
                "event=snapshot_load module=store status=ignored stream_id={} snapshot_version={} stream_version={}",
                stream_id, version, stream_version
            );
            return Ok(None);
        }

        Ok(Some(Snapshot {
            stream_id: stream_id.to_string(),
            version,
            state,
        }))
    }
}

struct StreamHead {
    aggregate_type: String,
    version: u64,
}

fn load_stream_head(conn: &Connection, stream_id: &str) -> StoreResult<Option<StreamHead>> {
    let head = conn
        .query_row(
            "SELECT aggregate_type, version FROM streams WHERE stream_id = ?1;",
            [stream_id],
            |row| {
                Ok(StreamHead {
                    aggregate_type: row.get(0)?,
                    version: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()?;
    Ok(head)
}

fn parse_event_row(row: &Row<'_>) -> StoreResult<StoredEvent> {
    let global_position: i64 = row.get("global_position")?;
    let sequence_number: i64 = row.get("sequence_number")?;
    if global_position < 1 || sequence_number < 1 {
        return Err(StoreError::InvalidData(format!(
            "non-positive position {global_position}/{sequence_number} in events"
        )));
    }

    Ok(StoredEvent {
        stream_id: row.get("stream_id")?,
        aggregate_type: row.get("aggregate_type")?,
        sequence_number: sequence_number as u64,
        event_type: row.get("event_type")?,
        payload: row.get("payload")?,
        occurred_at: row.get("occurred_at")?,
        global_position: global_position as u64,
    })
}
