//! Schema steps for the ledger database.
//!
//! The schema covers the append-only event log, aggregate snapshots and the
//! checkpoint and health rows kept by the projection orchestrator. View tables
//! are not listed here: each projection creates its own, so a rebuild can
//! recreate them without touching the schema version.
//!
//! The applied step is recorded in `PRAGMA user_version`. Pending steps run
//! in one transaction, so a failed step leaves the database at its previous
//! version.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "event_log",
        sql: include_str!("0001_event_log.sql"),
    },
    SchemaStep {
        version: 2,
        name: "snapshots",
        sql: include_str!("0002_snapshots.sql"),
    },
    SchemaStep {
        version: 3,
        name: "projection_bookkeeping",
        sql: include_str!("0003_projection_bookkeeping.sql"),
    },
];

/// Schema version this build writes.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Brings `conn` up to [`latest_version`] and returns how many steps ran.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the file was written by a newer build.
pub(crate) fn apply_migrations(conn: &mut Connection) -> DbResult<usize> {
    let found = schema_version(conn)?;
    let latest = latest_version();
    if found > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: found,
            latest_supported: latest,
        });
    }

    let pending: Vec<&SchemaStep> = SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > found)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    for step in &pending {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
    }
    tx.commit()?;

    let names: Vec<&str> = pending.iter().map(|step| step.name).collect();
    info!(
        "event=db_migrate module=db status=ok from_version={} to_version={} steps={}",
        found,
        latest,
        names.join(",")
    );
    Ok(pending.len())
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}

#[cfg(test)]
mod tests {
    use super::{apply_migrations, latest_version, SCHEMA_STEPS};
    use rusqlite::Connection;

    #[test]
    fn steps_are_numbered_from_one_without_gaps() {
        for (index, step) in SCHEMA_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, index + 1, "step {}", step.name);
        }
    }

    #[test]
    fn second_run_applies_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&mut conn).unwrap(), SCHEMA_STEPS.len());
        assert_eq!(apply_migrations(&mut conn).unwrap(), 0);

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, latest_version());
    }
}
