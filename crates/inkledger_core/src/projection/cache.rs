//! Bounded cache of `TaskView` rows.
//!
//! # Invariants
//! - Entries are invalidated by the orchestrator after every committed batch
//!   that touched the task, and wholesale after a rebuild swap.
//! - A miss always falls through to the live tables.

use super::query::{ProjectionQueries, TaskView};
use super::ProjectionResult;
use crate::model::TaskId;
use moka::sync::Cache;

#[derive(Clone)]
pub struct TaskViewCache {
    entries: Cache<TaskId, TaskView>,
}

impl TaskViewCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity.max(1)),
        }
    }

    /// Cached lookup; absent tasks are not cached.
    pub fn get_or_load(
        &self,
        queries: &ProjectionQueries<'_>,
        task_id: TaskId,
    ) -> ProjectionResult<Option<TaskView>> {
        if let Some(view) = self.entries.get(&task_id) {
            return Ok(Some(view));
        }
        let loaded = queries.task(task_id)?;
        if let Some(view) = &loaded {
            self.entries.insert(task_id, view.clone());
        }
        Ok(loaded)
    }

    pub fn invalidate<'a>(&self, task_ids: impl IntoIterator<Item = &'a TaskId>) {
        for task_id in task_ids {
            self.entries.invalidate(task_id);
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.contains_key(task_id)
    }
}

impl std::fmt::Debug for TaskViewCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskViewCache")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}
