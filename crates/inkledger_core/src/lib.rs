//! Event-sourced task core for inkledger.
//!
//! Tasks, categories and documents are aggregates rebuilt from an
//! append-only SQLite event log. Read models are projections kept current by
//! catch-up, and tasks written as `[...]` markers in saved documents are
//! reconciled into the task projection in the background.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod extraction;
pub mod logging;
pub mod model;
pub mod projection;
pub mod reconcile;
pub mod runtime;
pub mod service;
pub mod store;
pub mod tags;

pub use aggregate::category::{CategoryCommand, CategoryEvent, CategoryState};
pub use aggregate::document::{DocumentCommand, DocumentEvent, DocumentState};
pub use aggregate::task::{TaskCommand, TaskEvent, TaskSource, TaskState};
pub use aggregate::{replay, Aggregate, AggregateLoader, AggregateRoot, DecideError};
pub use config::{ConfigError, CoreConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult, SharedConnection};
pub use extraction::{parse_candidates, TaskCandidate};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::tags::TagSet;
pub use model::{CategoryId, DocumentId, TaskId};
pub use projection::{
    CategoryView, DocumentView, ProjectionError, ProjectionOrchestrator, ProjectionQueries,
    ProjectionResult, TaskView,
};
pub use reconcile::{
    DocumentSaved, DocumentTextSource, FileTextSource, ReconcileError, ReconcileReport,
    ReconciliationService,
};
pub use runtime::{CancellationToken, CoreRuntime, RuntimeError};
pub use service::{CommandBus, CommandBusOptions, CommandError, CommandReceipt, CommandResult};
pub use store::{ExpectedVersion, SqliteEventStore, StoreError, StoreResult, StoredEvent};
pub use tags::TagInheritanceResolver;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
