//! Derived read models maintained from the global event log.
//!
//! # Responsibility
//! - Decode stored events into the closed `DomainEvent` union.
//! - Define the `Projection` seam implemented by each read model.
//! - Track per-projection checkpoints and skipped-event health.
//!
//! # Invariants
//! - Projection tables are written only by `ProjectionOrchestrator`.
//! - Checkpoint and projection writes of one batch commit together.
//! - Every projection table can be dropped and rebuilt from the log alone.

mod cache;
mod checkpoint;
mod container_projection;
mod orchestrator;
pub mod query;
mod task_projection;

pub use cache::TaskViewCache;
pub use checkpoint::{load_checkpoint, load_health, ProjectionHealth};
pub use container_projection::ContainerProjection;
pub use orchestrator::{CatchUpReport, OrchestratorOptions, ProjectionOrchestrator, RebuildReport};
pub use query::{CategoryView, DocumentView, ProjectionQueries, TaskView};
pub use task_projection::TaskProjection;

use crate::aggregate::category::{CategoryEvent, CATEGORY_AGGREGATE};
use crate::aggregate::document::{DocumentEvent, DOCUMENT_AGGREGATE};
use crate::aggregate::task::{TaskEvent, TASK_AGGREGATE};
use crate::aggregate::decode_event;
use crate::db::DbError;
use crate::model::{parse_stream_id, CategoryId, DocumentId, TaskId};
use crate::store::{StoreError, StoreResult, StoredEvent};
use rusqlite::Connection;

pub type ProjectionResult<T> = Result<T, ProjectionError>;

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid projection data: {0}")]
    InvalidData(String),
    #[error("unknown projection `{0}`")]
    UnknownProjection(String),
}

impl From<DbError> for ProjectionError {
    fn from(value: DbError) -> Self {
        Self::Store(StoreError::Db(value))
    }
}

/// Event log entry decoded into its aggregate's event enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    Task {
        task_id: TaskId,
        event: TaskEvent,
    },
    Category {
        category_id: CategoryId,
        event: CategoryEvent,
    },
    Document {
        document_id: DocumentId,
        event: DocumentEvent,
    },
}

impl DomainEvent {
    /// Decodes `stored` by its aggregate type.
    ///
    /// # Errors
    /// - `StoreError::Deserialization` for unknown aggregate types, malformed
    ///   stream ids and undecodable payloads.
    pub fn decode(stored: &StoredEvent) -> StoreResult<Self> {
        let id = parse_stream_id(&stored.aggregate_type, &stored.stream_id)
            .ok_or_else(|| undecodable(stored, "stream id does not match aggregate type"))?;
        match stored.aggregate_type.as_str() {
            TASK_AGGREGATE => Ok(Self::Task {
                task_id: id,
                event: decode_event(stored)?,
            }),
            CATEGORY_AGGREGATE => Ok(Self::Category {
                category_id: id,
                event: decode_event(stored)?,
            }),
            DOCUMENT_AGGREGATE => Ok(Self::Document {
                document_id: id,
                event: decode_event(stored)?,
            }),
            other => Err(undecodable(stored, &format!("unknown aggregate type `{other}`"))),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Task { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

fn undecodable(stored: &StoredEvent, message: &str) -> StoreError {
    StoreError::Deserialization {
        stream_id: stored.stream_id.clone(),
        sequence_number: stored.sequence_number,
        message: message.to_string(),
    }
}

/// Which physical tables a projection writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTarget {
    Live,
    /// Shadow tables filled by a rebuild before the swap.
    Rebuild,
}

impl StoreTarget {
    pub fn table(self, base: &str) -> String {
        match self {
            Self::Live => base.to_string(),
            Self::Rebuild => format!("{base}_rebuild"),
        }
    }
}

/// A read model fed from the global log.
pub trait Projection: Send + Sync {
    /// Checkpoint key; stable across releases.
    fn name(&self) -> &'static str;

    /// Base names of every table this projection owns.
    fn tables(&self) -> &'static [&'static str];

    /// Creates the tables for `target` if they do not exist. No indexes.
    fn create_tables(&self, conn: &Connection, target: StoreTarget) -> ProjectionResult<()>;

    /// Creates indexes on the live tables if they do not exist.
    fn create_indexes(&self, conn: &Connection) -> ProjectionResult<()>;

    /// Applies one decoded event. Events of other aggregates are ignored.
    fn apply(
        &self,
        conn: &Connection,
        target: StoreTarget,
        stored: &StoredEvent,
        event: &DomainEvent,
    ) -> ProjectionResult<()>;
}

pub(crate) fn tags_to_json(tags: &crate::model::tags::TagSet) -> ProjectionResult<String> {
    serde_json::to_string(tags).map_err(|err| ProjectionError::InvalidData(err.to_string()))
}

pub(crate) fn tags_from_json(
    value: &str,
    column: &str,
) -> ProjectionResult<crate::model::tags::TagSet> {
    serde_json::from_str(value)
        .map_err(|err| ProjectionError::InvalidData(format!("invalid {column}: {err}")))
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> ProjectionResult<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|_| ProjectionError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}
