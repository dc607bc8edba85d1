//! Explicit removal of orphaned tasks.
//!
//! Reconciliation never calls this; orphans stay until a caller asks.

use super::service::ReconcileError;
use crate::aggregate::task::TaskCommand;
use crate::model::DocumentId;
use crate::service::CommandBus;
use log::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes every orphaned task that was derived from `document_id`.
pub fn purge_orphaned_tasks(
    bus: &CommandBus,
    document_id: DocumentId,
) -> Result<PurgeReport, ReconcileError> {
    bus.catch_up()?;
    let orphaned = bus.read(|queries| queries.orphaned_tasks_for_document(document_id))?;
    let commands = orphaned
        .into_iter()
        .map(|task| (task.task_id, TaskCommand::Delete))
        .collect();

    let mut report = PurgeReport::default();
    for result in bus.dispatch_task_batch(commands) {
        match result {
            Ok(_) => report.deleted += 1,
            Err(_) => report.failed += 1,
        }
    }
    info!(
        "event=purge_orphans module=reconcile status=ok document_id={} deleted={} failed={}",
        document_id, report.deleted, report.failed
    );
    Ok(report)
}
