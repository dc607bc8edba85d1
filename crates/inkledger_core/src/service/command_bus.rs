//! Typed command surface over task, category and document aggregates.
//!
//! # Responsibility
//! - Validate hierarchy references that need more than one aggregate.
//! - Load, decide and append with optimistic concurrency.
//! - Retry conflicts by reloading and deciding again.
//! - Keep projections current after successful commands.
//!
//! # Invariants
//! - The connection lock is taken per operation: loading and appending are
//!   separate critical sections, so concurrent writers surface as conflicts.
//! - A command that decides no events appends nothing and still succeeds.
//! - Conflict retries stop after `conflict_max_attempts`.

use crate::aggregate::category::{CategoryCommand, CategoryState};
use crate::aggregate::document::{DocumentCommand, DocumentState};
use crate::aggregate::task::{TaskCommand, TaskState};
use crate::aggregate::{encode_event, Aggregate, AggregateLoader, AggregateRoot, DecideError};
use crate::db::{IoRetryPolicy, SharedConnection};
use crate::model::{now_epoch_ms, stream_id, CategoryId, DocumentId, TaskId};
use crate::projection::{
    ProjectionError, ProjectionOrchestrator, ProjectionQueries, ProjectionResult,
};
use crate::store::{SqliteEventStore, StoreError, StoreResult};
use crate::tags::{PropagationJob, PropagationSink, TagInheritanceResolver};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

pub type CommandResult<T> = Result<T, CommandError>;

/// Caller-facing command failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("concurrency conflict on `{stream_id}` after {attempts} attempts")]
    ConcurrencyConflict {
        stream_id: String,
        attempts: u32,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stored data could not be decoded: {0}")]
    Deserialization(String),
    #[error("storage failure: {0}")]
    Io(String),
}

impl CommandError {
    /// Short text suitable for inline display next to the edited item.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::ConcurrencyConflict { .. } => {
                "This item was changed elsewhere. Please try again.".to_string()
            }
            Self::NotFound(_) => "This item no longer exists.".to_string(),
            Self::Deserialization(_) => "Stored data for this item could not be read.".to_string(),
            Self::Io(_) => "Storage is unavailable right now. Please try again.".to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ConcurrencyConflict { stream_id, .. } => Self::ConcurrencyConflict {
                stream_id,
                attempts: 1,
            },
            StoreError::EmptyAppend(_) | StoreError::AggregateTypeMismatch { .. } => {
                Self::Validation(value.to_string())
            }
            StoreError::Deserialization { .. } | StoreError::Serialization(_) => {
                Self::Deserialization(value.to_string())
            }
            StoreError::SnapshotAhead { .. } | StoreError::InvalidData(_) | StoreError::Db(_) => {
                Self::Io(value.to_string())
            }
        }
    }
}

impl From<ProjectionError> for CommandError {
    fn from(value: ProjectionError) -> Self {
        match value {
            ProjectionError::Store(err) => err.into(),
            other => Self::Io(other.to_string()),
        }
    }
}

/// Result of one accepted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub stream_id: String,
    /// Stream version after the command.
    pub version: u64,
    /// Events appended; `0` for a no-op.
    pub events_appended: usize,
    pub last_position: Option<u64>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBusOptions {
    pub conflict_max_attempts: u32,
    pub conflict_backoff: Duration,
    pub io_retry: IoRetryPolicy,
    /// Snapshot every N events; `0` disables snapshots.
    pub snapshot_interval: u64,
    pub max_hierarchy_depth: usize,
    /// Run projection catch-up after each successful command.
    pub sync_catch_up: bool,
}

impl Default for CommandBusOptions {
    fn default() -> Self {
        Self {
            conflict_max_attempts: 3,
            conflict_backoff: Duration::from_millis(100),
            io_retry: IoRetryPolicy::default(),
            snapshot_interval: 50,
            max_hierarchy_depth: crate::model::DEFAULT_MAX_HIERARCHY_DEPTH,
            sync_catch_up: true,
        }
    }
}

pub struct CommandBus {
    conn: SharedConnection,
    orchestrator: Arc<ProjectionOrchestrator>,
    options: CommandBusOptions,
    resolver: TagInheritanceResolver,
    propagation: OnceCell<Weak<dyn PropagationSink>>,
}

impl CommandBus {
    pub fn new(
        conn: SharedConnection,
        orchestrator: Arc<ProjectionOrchestrator>,
        options: CommandBusOptions,
    ) -> Self {
        Self {
            conn,
            orchestrator,
            resolver: TagInheritanceResolver::new(options.max_hierarchy_depth),
            options,
            propagation: OnceCell::new(),
        }
    }

    /// Routes inheritance changes to `sink`. Only the first sink is kept, and
    /// only while its owner keeps it alive.
    pub fn attach_propagation(&self, sink: Arc<dyn PropagationSink>) -> bool {
        self.propagation.set(Arc::downgrade(&sink)).is_ok()
    }

    pub fn orchestrator(&self) -> &Arc<ProjectionOrchestrator> {
        &self.orchestrator
    }

    pub fn resolver(&self) -> TagInheritanceResolver {
        self.resolver
    }

    /// Runs `read` against the live projection tables.
    pub fn read<T>(
        &self,
        read: impl FnOnce(&ProjectionQueries<'_>) -> ProjectionResult<T>,
    ) -> ProjectionResult<T> {
        let conn = self.conn.lock();
        read(&ProjectionQueries::with_max_depth(
            &conn,
            self.options.max_hierarchy_depth,
        ))
    }

    pub fn dispatch_task(
        &self,
        task_id: TaskId,
        command: TaskCommand,
    ) -> CommandResult<CommandReceipt> {
        let command = self.prepare_task(task_id, command)?;
        let receipt = self.execute::<TaskState>(task_id, &command)?;
        self.after_commit(&receipt);
        Ok(receipt)
    }

    /// Dispatches each command in order, continuing past failures, with one
    /// catch-up at the end.
    pub fn dispatch_task_batch(
        &self,
        commands: Vec<(TaskId, TaskCommand)>,
    ) -> Vec<CommandResult<CommandReceipt>> {
        let results: Vec<_> = commands
            .into_iter()
            .map(|(task_id, command)| {
                self.prepare_task(task_id, command)
                    .and_then(|command| self.execute::<TaskState>(task_id, &command))
            })
            .collect();

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!(
                "event=command_batch module=service status=partial total={} failed={}",
                results.len(),
                failed
            );
        }
        if self.options.sync_catch_up && results.iter().any(|result| result.is_ok()) {
            self.catch_up_quietly();
        }
        results
    }

    pub fn dispatch_category(
        &self,
        category_id: CategoryId,
        command: CategoryCommand,
    ) -> CommandResult<CommandReceipt> {
        self.check_category_command(category_id, &command)?;
        let receipt = self.execute::<CategoryState>(category_id, &command)?;
        self.after_commit(&receipt);
        if receipt.events_appended > 0 && command.affects_inheritance() {
            self.enqueue_propagation(PropagationJob::Category(category_id));
        }
        Ok(receipt)
    }

    pub fn dispatch_document(
        &self,
        document_id: DocumentId,
        command: DocumentCommand,
    ) -> CommandResult<CommandReceipt> {
        match &command {
            DocumentCommand::Register { category_id, .. }
            | DocumentCommand::Move { category_id } => {
                if let Some(category_id) = category_id {
                    self.require_category(*category_id)?;
                }
            }
            _ => {}
        }
        let receipt = self.execute::<DocumentState>(document_id, &command)?;
        self.after_commit(&receipt);
        if receipt.events_appended > 0 && command.affects_inheritance() {
            self.enqueue_propagation(PropagationJob::Document(document_id));
        }
        Ok(receipt)
    }

    /// Loads the current state of one aggregate, for callers that need more
    /// than the projection offers.
    pub fn load<A: Aggregate>(&self, id: Uuid) -> CommandResult<AggregateRoot<A>> {
        let conn = self.conn.lock();
        let store = SqliteEventStore::with_retry_policy(&conn, self.options.io_retry);
        Ok(AggregateLoader::new(&store).load::<A>(&stream_id(A::AGGREGATE_TYPE, id))?)
    }

    /// Synchronous projection catch-up.
    pub fn catch_up(&self) -> CommandResult<()> {
        self.orchestrator.catch_up()?;
        Ok(())
    }

    fn prepare_task(&self, task_id: TaskId, command: TaskCommand) -> CommandResult<TaskCommand> {
        match command {
            TaskCommand::Create {
                task_id: command_task_id,
                text,
                category_id,
                source,
                inherited_tags,
            } => {
                if command_task_id != task_id {
                    return Err(CommandError::Validation(format!(
                        "task id mismatch: {command_task_id} != {task_id}"
                    )));
                }
                if let Some(category_id) = category_id {
                    self.require_category(category_id)?;
                }
                let inherited_tags = match inherited_tags {
                    Some(tags) => tags,
                    None => self.read(|queries| {
                        self.resolver.resolve_task(
                            queries,
                            category_id,
                            source.as_ref().map(|source| source.document_id),
                        )
                    })?,
                };
                Ok(TaskCommand::Create {
                    task_id,
                    text,
                    category_id,
                    source,
                    inherited_tags: Some(inherited_tags),
                })
            }
            TaskCommand::Move {
                category_id,
                inherited_tags,
            } => {
                if let Some(category_id) = category_id {
                    self.require_category(category_id)?;
                }
                let inherited_tags = match inherited_tags {
                    Some(tags) => tags,
                    None => {
                        let document_id = self
                            .load::<TaskState>(task_id)?
                            .state
                            .source
                            .map(|source| source.document_id);
                        self.read(|queries| {
                            self.resolver.resolve_task(queries, category_id, document_id)
                        })?
                    }
                };
                Ok(TaskCommand::Move {
                    category_id,
                    inherited_tags: Some(inherited_tags),
                })
            }
            other => Ok(other),
        }
    }

    fn check_category_command(
        &self,
        category_id: CategoryId,
        command: &CategoryCommand,
    ) -> CommandResult<()> {
        match command {
            CategoryCommand::Create {
                name, parent_id, ..
            } => {
                if let Some(parent_id) = parent_id {
                    self.require_category(*parent_id)?;
                }
                self.require_unique_sibling_name(*parent_id, name, category_id)
            }
            CategoryCommand::Rename { name } => {
                let parent_id = self
                    .read(|queries| queries.category(category_id))?
                    .and_then(|category| category.parent_id);
                self.require_unique_sibling_name(parent_id, name, category_id)
            }
            CategoryCommand::Move {
                parent_id: Some(parent_id),
            } => {
                self.require_category(*parent_id)?;
                let (is_descendant, name) = self.read(|queries| {
                    let is_descendant = queries
                        .descendant_categories(category_id)?
                        .iter()
                        .any(|descendant| descendant.category_id == *parent_id);
                    let name = queries.category(category_id)?.map(|category| category.name);
                    Ok((is_descendant, name))
                })?;
                if is_descendant || *parent_id == category_id {
                    return Err(CommandError::Validation(format!(
                        "move would create a cycle: {category_id} under {parent_id}"
                    )));
                }
                match name {
                    Some(name) => {
                        self.require_unique_sibling_name(Some(*parent_id), &name, category_id)
                    }
                    None => Ok(()),
                }
            }
            CategoryCommand::Move { parent_id: None } => {
                match self.read(|queries| queries.category(category_id))? {
                    Some(category) => {
                        self.require_unique_sibling_name(None, &category.name, category_id)
                    }
                    None => Ok(()),
                }
            }
            CategoryCommand::Delete => {
                let has_children = self.read(|queries| {
                    Ok(!queries.child_categories(Some(category_id))?.is_empty())
                })?;
                if has_children {
                    return Err(CommandError::Validation(
                        "category still has child categories".to_string(),
                    ));
                }
                Ok(())
            }
            CategoryCommand::SetTags { .. } | CategoryCommand::SetInheritance { .. } => Ok(()),
        }
    }

    fn require_category(&self, category_id: CategoryId) -> CommandResult<()> {
        match self.read(|queries| queries.category(category_id))? {
            Some(_) => Ok(()),
            None => Err(CommandError::Validation(format!(
                "category not found: {category_id}"
            ))),
        }
    }

    fn require_unique_sibling_name(
        &self,
        parent_id: Option<CategoryId>,
        name: &str,
        category_id: CategoryId,
    ) -> CommandResult<()> {
        let name = name.trim();
        let taken = self.read(|queries| {
            Ok(queries
                .child_categories(parent_id)?
                .iter()
                .any(|sibling| sibling.name == name && sibling.category_id != category_id))
        })?;
        if taken {
            return Err(CommandError::Validation(format!(
                "a sibling category named `{name}` already exists"
            )));
        }
        Ok(())
    }

    fn execute<A: Aggregate>(
        &self,
        id: Uuid,
        command: &A::Command,
    ) -> CommandResult<CommandReceipt> {
        let stream_id = stream_id(A::AGGREGATE_TYPE, id);
        let max_attempts = self.options.conflict_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_execute::<A>(&stream_id, command) {
                Ok(mut receipt) => {
                    receipt.attempts = attempt;
                    return Ok(receipt);
                }
                Err(CommandError::ConcurrencyConflict { .. }) if attempt < max_attempts => {
                    debug!(
                        "event=command_conflict module=service status=retry stream_id={} attempt={}",
                        stream_id, attempt
                    );
                    std::thread::sleep(self.options.conflict_backoff * attempt);
                    attempt += 1;
                }
                Err(CommandError::ConcurrencyConflict { .. }) => {
                    warn!(
                        "event=command_conflict module=service status=error stream_id={} attempts={}",
                        stream_id, attempt
                    );
                    return Err(CommandError::ConcurrencyConflict {
                        stream_id,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    debug!(
                        "event=command_dispatch module=service status=rejected stream_id={} command={} error={}",
                        stream_id,
                        command_kind(command),
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    fn try_execute<A: Aggregate>(
        &self,
        stream_id: &str,
        command: &A::Command,
    ) -> CommandResult<CommandReceipt> {
        let mut root = {
            let conn = self.conn.lock();
            let store = SqliteEventStore::with_retry_policy(&conn, self.options.io_retry);
            AggregateLoader::new(&store).load::<A>(stream_id)?
        };

        let events = root
            .state
            .decide(command, now_epoch_ms())
            .map_err(|err| match err {
                DecideError::Validation(message) => CommandError::Validation(message),
                DecideError::NotFound => CommandError::NotFound(stream_id.to_string()),
            })?;
        if events.is_empty() {
            return Ok(CommandReceipt {
                stream_id: stream_id.to_string(),
                version: root.version,
                events_appended: 0,
                last_position: None,
                attempts: 1,
            });
        }

        let encoded = events
            .iter()
            .map(encode_event)
            .collect::<StoreResult<Vec<_>>>()?;
        let expected = root.expected_version();
        let previous_version = root.version;

        let conn = self.conn.lock();
        let store = SqliteEventStore::with_retry_policy(&conn, self.options.io_retry);
        let outcome = store.append(stream_id, A::AGGREGATE_TYPE, expected, &encoded)?;

        let interval = self.options.snapshot_interval;
        if interval > 0 && outcome.version / interval > previous_version / interval {
            for event in &events {
                root.apply(event);
            }
            if let Err(err) = AggregateLoader::new(&store).save_snapshot(&root) {
                warn!(
                    "event=snapshot_save module=service status=error stream_id={} version={} error={}",
                    stream_id, root.version, err
                );
            }
        }

        Ok(CommandReceipt {
            stream_id: stream_id.to_string(),
            version: outcome.version,
            events_appended: events.len(),
            last_position: Some(outcome.last_position),
            attempts: 1,
        })
    }

    fn after_commit(&self, receipt: &CommandReceipt) {
        if receipt.events_appended > 0 && self.options.sync_catch_up {
            self.catch_up_quietly();
        }
    }

    fn catch_up_quietly(&self) {
        if let Err(err) = self.orchestrator.catch_up() {
            warn!(
                "event=projection_catch_up module=service status=error error={}",
                err
            );
        }
    }

    fn enqueue_propagation(&self, job: PropagationJob) {
        match self.propagation.get().and_then(Weak::upgrade) {
            Some(sink) => sink.enqueue(job),
            None => info!(
                "event=tag_propagation module=service status=skipped reason=no_sink job={:?}",
                job
            ),
        }
    }
}

fn command_kind<C: std::fmt::Debug>(command: &C) -> String {
    let debug = format!("{command:?}");
    debug
        .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
        .next()
        .unwrap_or_default()
        .to_string()
}
