//! Checkpoint and health bookkeeping rows.

use super::ProjectionResult;
use crate::model::now_epoch_ms;
use rusqlite::{params, Connection, OptionalExtension};

/// Skipped-event counters of one projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionHealth {
    pub projection_name: String,
    pub skipped_events: u64,
    pub last_skipped_position: Option<u64>,
    pub last_error: Option<String>,
}

/// Last applied global position, `0` when the projection never ran.
pub fn load_checkpoint(conn: &Connection, projection_name: &str) -> ProjectionResult<u64> {
    let position: Option<i64> = conn
        .query_row(
            "SELECT position FROM projection_checkpoints WHERE projection_name = ?1;",
            [projection_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(position.unwrap_or(0).max(0) as u64)
}

pub(crate) fn save_checkpoint(
    conn: &Connection,
    projection_name: &str,
    position: u64,
) -> ProjectionResult<()> {
    conn.execute(
        "INSERT INTO projection_checkpoints (projection_name, position, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(projection_name) DO UPDATE SET
            position = excluded.position,
            updated_at = excluded.updated_at;",
        params![projection_name, position as i64, now_epoch_ms()],
    )?;
    Ok(())
}

pub fn load_health(conn: &Connection, projection_name: &str) -> ProjectionResult<ProjectionHealth> {
    let health = conn
        .query_row(
            "SELECT skipped_events, last_skipped_position, last_error
             FROM projection_health
             WHERE projection_name = ?1;",
            [projection_name],
            |row| {
                Ok(ProjectionHealth {
                    projection_name: projection_name.to_string(),
                    skipped_events: row.get::<_, i64>(0)?.max(0) as u64,
                    last_skipped_position: row
                        .get::<_, Option<i64>>(1)?
                        .map(|position| position.max(0) as u64),
                    last_error: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(health.unwrap_or_else(|| ProjectionHealth {
        projection_name: projection_name.to_string(),
        ..ProjectionHealth::default()
    }))
}

/// Counts one skipped event against `projection_name`.
pub(crate) fn record_skip(
    conn: &Connection,
    projection_name: &str,
    position: u64,
    error: &str,
) -> ProjectionResult<()> {
    conn.execute(
        "INSERT INTO projection_health
            (projection_name, skipped_events, last_skipped_position, last_error, updated_at)
         VALUES (?1, 1, ?2, ?3, ?4)
         ON CONFLICT(projection_name) DO UPDATE SET
            skipped_events = projection_health.skipped_events + 1,
            last_skipped_position = excluded.last_skipped_position,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at;",
        params![projection_name, position as i64, error, now_epoch_ms()],
    )?;
    Ok(())
}

/// Replaces the health row with counters collected during a rebuild.
pub(crate) fn replace_health(conn: &Connection, health: &ProjectionHealth) -> ProjectionResult<()> {
    conn.execute(
        "INSERT INTO projection_health
            (projection_name, skipped_events, last_skipped_position, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(projection_name) DO UPDATE SET
            skipped_events = excluded.skipped_events,
            last_skipped_position = excluded.last_skipped_position,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at;",
        params![
            health.projection_name.as_str(),
            health.skipped_events as i64,
            health.last_skipped_position.map(|position| position as i64),
            health.last_error.as_deref(),
            now_epoch_ms(),
        ],
    )?;
    Ok(())
}
