//! Three-way diff between live derived tasks and freshly parsed candidates.
//!
//! # Invariants
//! - Planning is pure: same inputs, same plan, same order.
//! - Existing tasks are never deleted; missing ones are orphaned.
//! - Matched tasks are only touched; their content is not rewritten.

use crate::extraction::TaskCandidate;
use crate::model::TaskId;
use std::collections::{BTreeMap, BTreeSet};

/// A live task already derived from the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingTask {
    pub task_id: TaskId,
    pub stable_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    Create { candidate: TaskCandidate },
    MarkOrphaned {
        task_id: TaskId,
        stable_id: String,
    },
    Touch {
        task_id: TaskId,
        stable_id: String,
    },
}

impl ReconcileAction {
    pub fn stable_id(&self) -> &str {
        match self {
            Self::Create { candidate } => &candidate.stable_id,
            Self::MarkOrphaned { stable_id, .. } | Self::Touch { stable_id, .. } => stable_id,
        }
    }
}

/// Actions ordered by stable id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub actions: Vec<ReconcileAction>,
}

impl ReconcilePlan {
    pub fn creates(&self) -> usize {
        self.count(|action| matches!(action, ReconcileAction::Create { .. }))
    }

    pub fn orphans(&self) -> usize {
        self.count(|action| matches!(action, ReconcileAction::MarkOrphaned { .. }))
    }

    pub fn touches(&self) -> usize {
        self.count(|action| matches!(action, ReconcileAction::Touch { .. }))
    }

    /// `true` when the plan would add or orphan nothing.
    pub fn is_steady(&self) -> bool {
        self.creates() == 0 && self.orphans() == 0
    }

    fn count(&self, predicate: impl Fn(&ReconcileAction) -> bool) -> usize {
        self.actions.iter().filter(|action| predicate(action)).count()
    }
}

/// Diffs `existing` against `candidates` by stable id.
///
/// When several live tasks share one stable id, the one with the smallest
/// task id is kept and the rest are orphaned. Duplicate candidate ids keep
/// the first occurrence.
pub fn plan(existing: &[ExistingTask], candidates: &[TaskCandidate]) -> ReconcilePlan {
    let mut live: BTreeMap<&str, Vec<TaskId>> = BTreeMap::new();
    for task in existing {
        live.entry(task.stable_id.as_str()).or_default().push(task.task_id);
    }
    let mut parsed: BTreeMap<&str, &TaskCandidate> = BTreeMap::new();
    for candidate in candidates {
        parsed.entry(candidate.stable_id.as_str()).or_insert(candidate);
    }

    let stable_ids: BTreeSet<&str> = live.keys().chain(parsed.keys()).copied().collect();
    let mut actions = Vec::new();
    for stable_id in stable_ids {
        let candidate = parsed.get(stable_id);
        match live.remove(stable_id) {
            Some(task_ids) => push_live(&mut actions, stable_id, task_ids, candidate.is_some()),
            None => {
                if let Some(candidate) = candidate {
                    actions.push(ReconcileAction::Create {
                        candidate: (*candidate).clone(),
                    });
                }
            }
        }
    }
    ReconcilePlan { actions }
}

fn push_live(
    actions: &mut Vec<ReconcileAction>,
    stable_id: &str,
    mut task_ids: Vec<TaskId>,
    matched: bool,
) {
    task_ids.sort();
    for (index, task_id) in task_ids.into_iter().enumerate() {
        let stable_id = stable_id.to_string();
        if matched && index == 0 {
            actions.push(ReconcileAction::Touch { task_id, stable_id });
        } else {
            actions.push(ReconcileAction::MarkOrphaned { task_id, stable_id });
        }
    }
}
