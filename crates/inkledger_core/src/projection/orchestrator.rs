//! Catch-up and rebuild driver for all registered projections.
//!
//! # Responsibility
//! - Feed each projection the global log after its own checkpoint.
//! - Rebuild a projection into shadow tables and swap them in atomically.
//! - Skip and count events that cannot be decoded.
//!
//! # Invariants
//! - Catch-up and rebuild are serialized by `run_lock`; nothing else writes
//!   projection tables.
//! - The connection lock is held per batch and never across a retry delay,
//!   so queries interleave with long rebuilds and keep reading live tables.
//! - A batch commits its writes, skip counters and checkpoint together.

use super::cache::TaskViewCache;
use super::checkpoint::{load_checkpoint, load_health, record_skip, replace_health, save_checkpoint};
use super::{
    ContainerProjection, DomainEvent, Projection, ProjectionError, ProjectionHealth,
    ProjectionResult, StoreTarget, TaskProjection,
};
use crate::db::SharedConnection;
use crate::model::TaskId;
use crate::store::{SqliteEventStore, StoredEvent};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_CATCH_UP_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub batch_size: usize,
    /// Attempts per batch before a write failure is surfaced.
    pub max_apply_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_CATCH_UP_BATCH_SIZE,
            max_apply_attempts: 3,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub applied: u64,
    pub skipped: u64,
    pub batches: u64,
}

impl CatchUpReport {
    fn absorb(&mut self, batch: &BatchOutcome) {
        self.applied += batch.applied;
        self.skipped += batch.skipped;
        self.batches += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub projection: String,
    pub applied: u64,
    pub skipped: u64,
    pub position: u64,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    applied: u64,
    skipped: u64,
    last_position: u64,
    touched_tasks: Vec<TaskId>,
}

pub struct ProjectionOrchestrator {
    conn: SharedConnection,
    projections: Vec<Arc<dyn Projection>>,
    options: OrchestratorOptions,
    cache: Option<TaskViewCache>,
    run_lock: Mutex<()>,
}

impl ProjectionOrchestrator {
    /// Orchestrator over the `tasks` and `containers` projections.
    pub fn new(conn: SharedConnection, options: OrchestratorOptions) -> ProjectionResult<Self> {
        Self::with_projections(
            conn,
            options,
            vec![Arc::new(TaskProjection), Arc::new(ContainerProjection)],
        )
    }

    /// Creates live tables and indexes for every projection.
    pub fn with_projections(
        conn: SharedConnection,
        options: OrchestratorOptions,
        projections: Vec<Arc<dyn Projection>>,
    ) -> ProjectionResult<Self> {
        {
            let guard = conn.lock();
            for projection in &projections {
                projection.create_tables(&guard, StoreTarget::Live)?;
                projection.create_indexes(&guard)?;
            }
        }
        Ok(Self {
            conn,
            projections,
            options: OrchestratorOptions {
                batch_size: options.batch_size.max(1),
                max_apply_attempts: options.max_apply_attempts.max(1),
                ..options
            },
            cache: None,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_cache(mut self, cache: TaskViewCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&TaskViewCache> {
        self.cache.as_ref()
    }

    pub fn projection_names(&self) -> Vec<&'static str> {
        self.projections.iter().map(|projection| projection.name()).collect()
    }

    pub fn checkpoint(&self, name: &str) -> ProjectionResult<u64> {
        self.find(name)?;
        load_checkpoint(&self.conn.lock(), name)
    }

    pub fn health(&self, name: &str) -> ProjectionResult<ProjectionHealth> {
        self.find(name)?;
        load_health(&self.conn.lock(), name)
    }

    /// Applies every event after each projection's checkpoint.
    pub fn catch_up(&self) -> ProjectionResult<CatchUpReport> {
        let _run = self.run_lock.lock();
        let mut report = CatchUpReport::default();
        for projection in &self.projections {
            while let Some(batch) = self.run_batch(projection.as_ref())? {
                report.absorb(&batch);
            }
        }
        if report.batches > 0 {
            debug!(
                "event=projection_catch_up module=projection status=ok applied={} skipped={} batches={}",
                report.applied, report.skipped, report.batches
            );
        }
        Ok(report)
    }

    fn run_batch(&self, projection: &dyn Projection) -> ProjectionResult<Option<BatchOutcome>> {
        let mut attempt = 1;
        loop {
            match self.catch_up_batch(projection) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < self.options.max_apply_attempts => {
                    warn!(
                        "event=projection_batch module=projection status=retry projection={} attempt={} error={}",
                        projection.name(),
                        attempt,
                        err
                    );
                    std::thread::sleep(self.options.retry_backoff * attempt);
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        "event=projection_batch module=projection status=error projection={} attempts={} error={}",
                        projection.name(),
                        attempt,
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    fn catch_up_batch(
        &self,
        projection: &dyn Projection,
    ) -> ProjectionResult<Option<BatchOutcome>> {
        let name = projection.name();
        let outcome = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let position = load_checkpoint(&tx, name)?;
            let events = SqliteEventStore::new(&tx).read_global(position, self.options.batch_size)?;
            if events.is_empty() {
                return Ok(None);
            }

            let mut outcome = BatchOutcome::default();
            for stored in &events {
                if let Some(skip_error) =
                    apply_or_skip(&tx, projection, StoreTarget::Live, stored, &mut outcome)?
                {
                    record_skip(&tx, name, stored.global_position, &skip_error)?;
                }
            }
            save_checkpoint(&tx, name, outcome.last_position)?;
            tx.commit()?;
            outcome
        };

        if let Some(cache) = &self.cache {
            cache.invalidate(&outcome.touched_tasks);
        }
        Ok(Some(outcome))
    }

    /// Rebuilds every projection in registration order.
    pub fn rebuild_all(&self) -> ProjectionResult<Vec<RebuildReport>> {
        self.projection_names()
            .into_iter()
            .map(|name| self.rebuild(name))
            .collect()
    }

    /// Replays the whole log into shadow tables, then swaps them in.
    pub fn rebuild(&self, name: &str) -> ProjectionResult<RebuildReport> {
        let projection = self.find(name)?;
        let _run = self.run_lock.lock();
        let started_at = Instant::now();
        info!(
            "event=projection_rebuild module=projection status=start projection={}",
            name
        );

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            drop_tables(&tx, projection.as_ref(), StoreTarget::Rebuild)?;
            projection.create_tables(&tx, StoreTarget::Rebuild)?;
            tx.commit()?;
        }

        let mut position = 0;
        let mut applied = 0;
        let mut health = ProjectionHealth {
            projection_name: name.to_string(),
            ..ProjectionHealth::default()
        };
        loop {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let events = SqliteEventStore::new(&tx).read_global(position, self.options.batch_size)?;
            if events.is_empty() {
                break;
            }
            let mut outcome = BatchOutcome::default();
            for stored in &events {
                if let Some(skip_error) = apply_or_skip(
                    &tx,
                    projection.as_ref(),
                    StoreTarget::Rebuild,
                    stored,
                    &mut outcome,
                )? {
                    health.skipped_events += 1;
                    health.last_skipped_position = Some(stored.global_position);
                    health.last_error = Some(skip_error);
                }
            }
            tx.commit()?;
            applied += outcome.applied;
            position = outcome.last_position;
        }

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            drop_tables(&tx, projection.as_ref(), StoreTarget::Live)?;
            for table in projection.tables() {
                tx.execute_batch(&format!(
                    "ALTER TABLE {shadow} RENAME TO {table};",
                    shadow = StoreTarget::Rebuild.table(table)
                ))?;
            }
            projection.create_indexes(&tx)?;
            save_checkpoint(&tx, name, position)?;
            replace_health(&tx, &health)?;
            tx.commit()?;
        }

        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        info!(
            "event=projection_rebuild module=projection status=ok projection={} applied={} skipped={} position={} duration_ms={}",
            name,
            applied,
            health.skipped_events,
            position,
            started_at.elapsed().as_millis()
        );
        Ok(RebuildReport {
            projection: name.to_string(),
            applied,
            skipped: health.skipped_events,
            position,
        })
    }

    fn find(&self, name: &str) -> ProjectionResult<Arc<dyn Projection>> {
        self.projections
            .iter()
            .find(|projection| projection.name() == name)
            .cloned()
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))
    }
}

/// Applies one event, or returns the decode error when it must be skipped.
fn apply_or_skip(
    conn: &Connection,
    projection: &dyn Projection,
    target: StoreTarget,
    stored: &StoredEvent,
    outcome: &mut BatchOutcome,
) -> ProjectionResult<Option<String>> {
    outcome.last_position = stored.global_position;
    match DomainEvent::decode(stored) {
        Ok(event) => {
            projection.apply(conn, target, stored, &event)?;
            if let Some(task_id) = event.task_id() {
                outcome.touched_tasks.push(task_id);
            }
            outcome.applied += 1;
            Ok(None)
        }
        Err(err) => {
            warn!(
                "event=projection_skip module=projection status=skipped projection={} position={} stream_id={} sequence={} error={}",
                projection.name(),
                stored.global_position,
                stored.stream_id,
                stored.sequence_number,
                err
            );
            outcome.skipped += 1;
            Ok(Some(err.to_string()))
        }
    }
}

fn drop_tables(
    conn: &Connection,
    projection: &dyn Projection,
    target: StoreTarget,
) -> ProjectionResult<()> {
    for table in projection.tables() {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", target.table(table)))?;
    }
    Ok(())
}
