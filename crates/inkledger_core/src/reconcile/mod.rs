//! Keeps derived tasks in step with bracket markers in saved documents.
//!
//! # Responsibility
//! - Plan create/orphan/touch actions from a parse of the saved text.
//! - Run passes through the command bus, debounced per document.
//! - Offer a separate, explicit purge of orphaned tasks.
//!
//! # Invariants
//! - A stable id maps to at most one live task per document.
//! - Reconciliation never deletes tasks or rewrites their content.
//! - Running a pass twice on unchanged text creates and orphans nothing.

mod cleanup;
mod engine;
mod scheduler;
mod service;

pub use cleanup::{purge_orphaned_tasks, PurgeReport};
pub use engine::{plan, ExistingTask, ReconcileAction, ReconcilePlan};
pub use scheduler::{ReconciliationScheduler, DEFAULT_DEBOUNCE_WINDOW};
pub use service::{
    DocumentSaved, DocumentTextSource, FileTextSource, ReconcileError, ReconcileReport,
    ReconciliationService, SaveHandler,
};
