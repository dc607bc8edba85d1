//! Wires storage, projections, command bus and background workers.
//!
//! # Responsibility
//! - Open the database described by `CoreConfig`.
//! - Start the projection poller, reconciliation scheduler and tag
//!   propagator on one shared cancellation token.
//! - Stop and join all of them on `shutdown`.

use super::cancel::CancellationToken;
use super::poller::ProjectionPoller;
use super::worker::WorkerError;
use crate::config::{ConfigError, CoreConfig};
use crate::db::{open_db, open_db_in_memory, share, DbError};
use crate::logging::{init_from_config, LoggingError};
use crate::model::{DocumentId, TaskId};
use crate::projection::{
    ProjectionError, ProjectionOrchestrator, ProjectionQueries, ProjectionResult, TaskView,
    TaskViewCache,
};
use crate::reconcile::{
    purge_orphaned_tasks, DocumentSaved, DocumentTextSource, PurgeReport, ReconcileError,
    ReconcileReport, ReconciliationScheduler, ReconciliationService,
};
use crate::service::CommandBus;
use crate::tags::TagPropagator;
use log::info;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

pub struct CoreRuntime {
    config: CoreConfig,
    bus: Arc<CommandBus>,
    cache: TaskViewCache,
    reconciler: Arc<ReconciliationService>,
    scheduler: ReconciliationScheduler,
    propagator: Arc<TagPropagator>,
    poller: ProjectionPoller,
    cancel: CancellationToken,
}

impl CoreRuntime {
    /// Starts logging if configured, opens `config.db_path` and spawns the
    /// background workers.
    pub fn open(
        config: CoreConfig,
        text_source: Arc<dyn DocumentTextSource>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        init_from_config(&config)?;
        let conn = open_db(&config.db_path)?;
        Self::start(config, conn, text_source)
    }

    /// Same as [`CoreRuntime::open`] over a private in-memory database.
    pub fn open_in_memory(
        config: CoreConfig,
        text_source: Arc<dyn DocumentTextSource>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let conn = open_db_in_memory()?;
        Self::start(config, conn, text_source)
    }

    fn start(
        config: CoreConfig,
        conn: Connection,
        text_source: Arc<dyn DocumentTextSource>,
    ) -> Result<Self, RuntimeError> {
        let conn = share(conn);
        let cancel = CancellationToken::new();
        let cache = TaskViewCache::new(config.task_cache_capacity);
        let orchestrator = Arc::new(
            ProjectionOrchestrator::new(Arc::clone(&conn), config.orchestrator_options())?
                .with_cache(cache.clone()),
        );
        orchestrator.catch_up()?;

        let bus = Arc::new(CommandBus::new(
            conn,
            Arc::clone(&orchestrator),
            config.command_bus_options(),
        ));
        let propagator = Arc::new(TagPropagator::spawn(
            Arc::clone(&bus),
            config.propagation_options(),
            cancel.clone(),
        )?);
        bus.attach_propagation(propagator.clone());

        let reconciler = Arc::new(ReconciliationService::new(Arc::clone(&bus), text_source));
        let scheduler = ReconciliationScheduler::spawn(
            reconciler.clone(),
            config.debounce_window(),
            cancel.clone(),
        )?;
        let poller = ProjectionPoller::spawn(orchestrator, config.poll_interval(), cancel.clone())?;

        info!(
            "event=runtime_start module=runtime status=ok poll_interval_ms={} debounce_ms={}",
            config.poll_interval_ms, config.debounce_ms
        );
        Ok(Self {
            config,
            bus,
            cache,
            reconciler,
            scheduler,
            propagator,
            poller,
            cancel,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    /// Queues a debounced reconciliation pass for the saved document.
    pub fn notify_document_saved(&self, saved: DocumentSaved) -> Result<(), WorkerError> {
        self.scheduler.notify(saved)
    }

    /// Runs a reconciliation pass on the calling thread, bypassing the
    /// debounce window.
    pub fn reconcile_now(&self, saved: &DocumentSaved) -> Result<ReconcileReport, ReconcileError> {
        self.reconciler.reconcile(saved)
    }

    pub fn purge_orphaned_tasks(
        &self,
        document_id: DocumentId,
    ) -> Result<PurgeReport, ReconcileError> {
        purge_orphaned_tasks(&self.bus, document_id)
    }

    /// Cached task lookup.
    pub fn task(&self, task_id: TaskId) -> ProjectionResult<Option<TaskView>> {
        self.bus.read(|queries| self.cache.get_or_load(queries, task_id))
    }

    pub fn with_queries<T>(
        &self,
        read: impl FnOnce(&ProjectionQueries<'_>) -> ProjectionResult<T>,
    ) -> ProjectionResult<T> {
        self.bus.read(read)
    }

    /// Waits for queued reconciliation and propagation work to drain.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.scheduler.wait_idle(timeout)
            && self
                .propagator
                .wait_idle(deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels background work and joins every worker thread.
    pub fn shutdown(&self) {
        let already = self.cancel.is_cancelled();
        self.cancel.cancel();
        self.scheduler.shutdown();
        self.propagator.shutdown();
        self.poller.shutdown();
        if !already {
            info!("event=runtime_shutdown module=runtime status=ok");
        }
    }
}

impl Drop for CoreRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
