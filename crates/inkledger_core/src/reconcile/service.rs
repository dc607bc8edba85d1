//! One reconciliation pass for a saved document.
//!
//! # Responsibility
//! - Make sure the document is registered under the right path.
//! - Parse its plain text and diff candidates against live tasks.
//! - Dispatch the plan through the command bus, continuing past failures.
//!
//! # Invariants
//! - Only create, orphan and last-seen commands are issued.
//! - Document text is never logged.

use super::engine::{plan, ExistingTask, ReconcileAction, ReconcilePlan};
use crate::aggregate::document::DocumentCommand;
use crate::aggregate::task::{TaskCommand, TaskSource};
use crate::extraction::parse_candidates;
use crate::model::tags::TagSet;
use crate::model::{DocumentId, TaskId};
use crate::projection::{DocumentView, ProjectionError};
use crate::service::{CommandBus, CommandError};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Inbound notification raised after a document is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSaved {
    pub document_id: DocumentId,
    pub file_path: String,
    /// Save time in epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("failed to read text of `{path}`: {message}")]
    TextSource {
        path: String,
        message: String,
    },
}

/// Supplies the plain text of a saved document.
pub trait DocumentTextSource: Send + Sync {
    fn plain_text(&self, saved: &DocumentSaved) -> Result<String, ReconcileError>;
}

/// Reads the saved file as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTextSource;

impl DocumentTextSource for FileTextSource {
    fn plain_text(&self, saved: &DocumentSaved) -> Result<String, ReconcileError> {
        std::fs::read_to_string(Path::new(&saved.file_path)).map_err(|err| {
            ReconcileError::TextSource {
                path: saved.file_path.clone(),
                message: err.to_string(),
            }
        })
    }
}

/// Consumer of save notifications; the scheduler calls this once per
/// debounced document.
pub trait SaveHandler: Send + Sync {
    fn handle_saved(&self, saved: DocumentSaved);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub orphaned: usize,
    pub touched: usize,
    pub failed: usize,
}

pub struct ReconciliationService {
    bus: Arc<CommandBus>,
    text_source: Arc<dyn DocumentTextSource>,
}

impl ReconciliationService {
    pub fn new(bus: Arc<CommandBus>, text_source: Arc<dyn DocumentTextSource>) -> Self {
        Self { bus, text_source }
    }

    pub fn reconcile(&self, saved: &DocumentSaved) -> Result<ReconcileReport, ReconcileError> {
        self.bus.catch_up()?;
        let document = self.ensure_document(saved)?;
        let text = self.text_source.plain_text(saved)?;
        let candidates = parse_candidates(&text);

        let resolver = self.bus.resolver();
        let (existing, inherited_tags) = self.bus.read(|queries| {
            let existing: Vec<ExistingTask> = queries
                .live_tasks_for_document(saved.document_id)?
                .into_iter()
                .filter_map(|task| {
                    task.source_stable_id.map(|stable_id| ExistingTask {
                        task_id: task.task_id,
                        stable_id,
                    })
                })
                .collect();
            let inherited =
                resolver.resolve_task(queries, document.category_id, Some(document.document_id))?;
            Ok((existing, inherited))
        })?;

        let plan = plan(&existing, &candidates);
        let commands = commands_for(&plan, &document, saved.timestamp, &inherited_tags);
        let results = self.bus.dispatch_task_batch(commands);

        let mut report = ReconcileReport::default();
        for (action, result) in plan.actions.iter().zip(results) {
            match result {
                Ok(_) => match action {
                    ReconcileAction::Create { .. } => report.created += 1,
                    ReconcileAction::MarkOrphaned { .. } => report.orphaned += 1,
                    ReconcileAction::Touch { .. } => report.touched += 1,
                },
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "event=reconcile_action module=reconcile status=error document_id={} stable_id={} error={}",
                        saved.document_id,
                        action.stable_id(),
                        err
                    );
                }
            }
        }

        info!(
            "event=reconcile module=reconcile status=ok document_id={} candidates={} created={} orphaned={} touched={} failed={}",
            saved.document_id,
            candidates.len(),
            report.created,
            report.orphaned,
            report.touched,
            report.failed
        );
        Ok(report)
    }

    fn ensure_document(&self, saved: &DocumentSaved) -> Result<DocumentView, ReconcileError> {
        let (document, category) = self.bus.read(|queries| {
            let document = queries.document(saved.document_id)?;
            let category = match document {
                Some(_) => None,
                None => queries.category_for_file_path(&saved.file_path)?,
            };
            Ok((document, category))
        })?;

        match document {
            Some(document) if document.file_path == saved.file_path.trim() => return Ok(document),
            Some(_) => {
                self.bus.dispatch_document(
                    saved.document_id,
                    DocumentCommand::Relocate {
                        file_path: saved.file_path.clone(),
                    },
                )?;
            }
            None => {
                self.bus.dispatch_document(
                    saved.document_id,
                    DocumentCommand::Register {
                        document_id: saved.document_id,
                        file_path: saved.file_path.clone(),
                        category_id: category.map(|category| category.category_id),
                    },
                )?;
            }
        }

        self.bus.catch_up()?;
        self.bus
            .read(|queries| queries.document(saved.document_id))?
            .ok_or_else(|| CommandError::NotFound(format!("document {}", saved.document_id)).into())
    }
}

impl SaveHandler for ReconciliationService {
    fn handle_saved(&self, saved: DocumentSaved) {
        if let Err(err) = self.reconcile(&saved) {
            error!(
                "event=reconcile module=reconcile status=error document_id={} error={}",
                saved.document_id, err
            );
        }
    }
}

fn commands_for(
    plan: &ReconcilePlan,
    document: &DocumentView,
    seen_at: i64,
    inherited_tags: &TagSet,
) -> Vec<(TaskId, TaskCommand)> {
    plan.actions
        .iter()
        .map(|action| match action {
            ReconcileAction::Create { candidate } => {
                let task_id = Uuid::new_v4();
                let command = TaskCommand::Create {
                    task_id,
                    text: candidate.text.clone(),
                    category_id: document.category_id,
                    source: Some(TaskSource {
                        document_id: document.document_id,
                        stable_id: candidate.stable_id.clone(),
                        line_number: candidate.line_number,
                    }),
                    inherited_tags: Some(inherited_tags.clone()),
                };
                (task_id, command)
            }
            ReconcileAction::MarkOrphaned { task_id, .. } => (
                *task_id,
                TaskCommand::MarkOrphaned {
                    document_id: document.document_id,
                },
            ),
            ReconcileAction::Touch { task_id, .. } => {
                (*task_id, TaskCommand::Touch { seen_at })
            }
        })
        .collect()
}
