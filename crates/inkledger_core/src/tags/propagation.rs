//! Background refresh of inherited task tags after hierarchy changes.
//!
//! # Responsibility
//! - Find tasks whose inherited tags may have changed.
//! - Dispatch `RefreshInheritedTags` only where the resolved set differs.
//!
//! # Invariants
//! - Manual tags are never touched.
//! - A refresh resolved for one category is dropped once the task has moved.
//! - Orphaned tasks keep the tags they had when orphaned.
//! - Cancellation is checked between batches; committed batches stay.

use crate::aggregate::task::TaskCommand;
use crate::model::{CategoryId, DocumentId, TaskId};
use crate::projection::{ProjectionResult, TaskView};
use crate::runtime::{BackgroundWorker, CancellationToken, WorkerError};
use crate::service::CommandBus;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PROPAGATION_BATCH_SIZE: usize = 10;
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_millis(100);
const PROPAGATION_QUEUE_CAPACITY: usize = 64;

/// Hierarchy node whose change may alter inherited tags below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropagationJob {
    Category(CategoryId),
    Document(DocumentId),
}

/// Receiver of propagation jobs raised by the command bus.
pub trait PropagationSink: Send + Sync {
    fn enqueue(&self, job: PropagationJob);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PROPAGATION_BATCH_SIZE,
            batch_delay: DEFAULT_PROPAGATION_DELAY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub examined: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Synchronous propagation pass; the background worker wraps this.
pub struct PropagationRunner {
    bus: Arc<CommandBus>,
    options: PropagationOptions,
}

impl PropagationRunner {
    pub fn new(bus: Arc<CommandBus>, options: PropagationOptions) -> Self {
        Self {
            bus,
            options: PropagationOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
        }
    }

    pub fn run(
        &self,
        job: PropagationJob,
        cancel: &CancellationToken,
    ) -> ProjectionResult<PropagationReport> {
        let resolver = self.bus.resolver();
        let (examined, refreshes) = self.bus.read(|queries| {
            let tasks = affected_tasks(queries, job)?;
            let mut refreshes = Vec::new();
            for task in &tasks {
                let resolved =
                    resolver.resolve_task(queries, task.category_id, task.source_document_id)?;
                if !resolved.same_members(&task.inherited_tags) {
                    refreshes.push((
                        task.task_id,
                        TaskCommand::RefreshInheritedTags {
                            category_id: task.category_id,
                            tags: resolved,
                        },
                    ));
                }
            }
            Ok((tasks.len(), refreshes))
        })?;

        let mut report = PropagationReport {
            examined,
            ..PropagationReport::default()
        };
        let batches: Vec<Vec<(TaskId, TaskCommand)>> = refreshes
            .chunks(self.options.batch_size)
            .map(<[_]>::to_vec)
            .collect();
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            for result in self.bus.dispatch_task_batch(batch) {
                match result {
                    Ok(_) => report.refreshed += 1,
                    Err(_) => report.failed += 1,
                }
            }
            if index + 1 < batch_count && cancel.wait_timeout(self.options.batch_delay) {
                report.cancelled = true;
                break;
            }
        }

        info!(
            "event=tag_propagation module=tags status=ok job={:?} examined={} refreshed={} failed={} cancelled={}",
            job, report.examined, report.refreshed, report.failed, report.cancelled
        );
        Ok(report)
    }
}

fn affected_tasks(
    queries: &crate::projection::ProjectionQueries<'_>,
    job: PropagationJob,
) -> ProjectionResult<Vec<TaskView>> {
    let tasks = match job {
        PropagationJob::Category(category_id) => {
            let mut seen = HashSet::new();
            queries
                .tasks_in_subtree(category_id)?
                .into_iter()
                .chain(queries.tasks_in_category(category_id)?)
                .filter(|task| seen.insert(task.task_id))
                .collect()
        }
        PropagationJob::Document(document_id) => queries.live_tasks_for_document(document_id)?,
    };
    Ok(tasks.into_iter().filter(|task| !task.is_orphaned).collect())
}

/// Queue-backed propagation worker.
pub struct TagPropagator {
    worker: BackgroundWorker<PropagationJob>,
}

impl TagPropagator {
    pub fn spawn(
        bus: Arc<CommandBus>,
        options: PropagationOptions,
        cancel: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let runner = PropagationRunner::new(bus, options);
        let worker = BackgroundWorker::spawn(
            "tag-propagation",
            PROPAGATION_QUEUE_CAPACITY,
            cancel,
            move |job, cancel| {
                if let Err(err) = runner.run(job, cancel) {
                    warn!(
                        "event=tag_propagation module=tags status=error job={:?} error={}",
                        job, err
                    );
                }
            },
        )?;
        Ok(Self { worker })
    }

    pub fn submit(&self, job: PropagationJob) -> Result<(), WorkerError> {
        self.worker.submit(job)
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.worker.wait_idle(timeout)
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }
}

impl PropagationSink for TagPropagator {
    fn enqueue(&self, job: PropagationJob) {
        if let Err(err) = self.submit(job) {
            warn!(
                "event=tag_propagation module=tags status=dropped job={:?} error={}",
                job, err
            );
        }
    }
}
