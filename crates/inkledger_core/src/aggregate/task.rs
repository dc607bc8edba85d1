//! Task aggregate.
//!
//! # Invariants
//! - `manual_tags` change only through `SetTags`; `inherited_tags` change only
//!   through creation, moves and `RefreshInheritedTags`.
//! - Reconciliation commands (`MarkOrphaned`, `Touch`) never change text,
//!   tags or completion.
//! - A deleted task accepts no further commands.

use super::{validate_tags, validate_text, Aggregate, DecideError, EventKind};
use crate::model::tags::TagSet;
use crate::model::{CategoryId, DocumentId, TaskId};
use serde::{Deserialize, Serialize};

pub const TASK_AGGREGATE: &str = "task";
pub const MAX_TASK_TEXT_CHARS: usize = 2000;

/// Where an extracted task came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSource {
    pub document_id: DocumentId,
    pub stable_id: String,
    /// 1-based line of the bracket span when extracted.
    pub line_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Created {
        task_id: TaskId,
        text: String,
        category_id: Option<CategoryId>,
        source: Option<TaskSource>,
        inherited_tags: TagSet,
        created_at: i64,
    },
    Renamed {
        text: String,
    },
    Completed {
        completed_at: i64,
    },
    Reopened,
    Moved {
        category_id: Option<CategoryId>,
        inherited_tags: TagSet,
    },
    ManualTagsSet {
        tags: TagSet,
    },
    InheritedTagsRefreshed {
        tags: TagSet,
    },
    Orphaned {
        document_id: DocumentId,
        orphaned_at: i64,
    },
    LastSeen {
        seen_at: i64,
    },
    Deleted {
        deleted_at: i64,
    },
}

impl EventKind for TaskEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "task_created",
            Self::Renamed { .. } => "task_renamed",
            Self::Completed { .. } => "task_completed",
            Self::Reopened => "task_reopened",
            Self::Moved { .. } => "task_moved",
            Self::ManualTagsSet { .. } => "task_manual_tags_set",
            Self::InheritedTagsRefreshed { .. } => "task_inherited_tags_refreshed",
            Self::Orphaned { .. } => "task_orphaned",
            Self::LastSeen { .. } => "task_last_seen",
            Self::Deleted { .. } => "task_deleted",
        }
    }
}

/// Commands accepted by the task aggregate.
///
/// `inherited_tags: None` on `Create`/`Move` asks the command bus to resolve
/// them from the container hierarchy before deciding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    Create {
        task_id: TaskId,
        text: String,
        category_id: Option<CategoryId>,
        source: Option<TaskSource>,
        inherited_tags: Option<TagSet>,
    },
    Rename {
        text: String,
    },
    Complete,
    Reopen,
    Delete,
    Move {
        category_id: Option<CategoryId>,
        inherited_tags: Option<TagSet>,
    },
    SetTags {
        tags: Vec<String>,
    },
    MarkOrphaned {
        document_id: DocumentId,
    },
    Touch {
        seen_at: i64,
    },
    /// `category_id` is the placement the tags were resolved for; the refresh
    /// is dropped if the task has moved since.
    RefreshInheritedTags {
        category_id: Option<CategoryId>,
        tags: TagSet,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: Option<TaskId>,
    pub text: String,
    pub category_id: Option<CategoryId>,
    pub source: Option<TaskSource>,
    pub manual_tags: TagSet,
    pub inherited_tags: TagSet,
    pub completed: bool,
    pub completed_at: Option<i64>,
    pub orphaned: bool,
    pub deleted: bool,
    pub last_seen_at: Option<i64>,
    pub created_at: Option<i64>,
}

impl TaskState {
    pub fn exists(&self) -> bool {
        self.id.is_some() && !self.deleted
    }

    /// `manual_tags ∪ inherited_tags`, manual spelling first.
    pub fn visible_tags(&self) -> TagSet {
        self.manual_tags.union(&self.inherited_tags)
    }
}

impl Aggregate for TaskState {
    type Event = TaskEvent;
    type Command = TaskCommand;

    const AGGREGATE_TYPE: &'static str = TASK_AGGREGATE;

    fn apply(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Created {
                task_id,
                text,
                category_id,
                source,
                inherited_tags,
                created_at,
            } => {
                self.id = Some(*task_id);
                self.text = text.clone();
                self.category_id = *category_id;
                self.source = source.clone();
                self.inherited_tags = inherited_tags.clone();
                self.created_at = Some(*created_at);
                self.last_seen_at = source.as_ref().map(|_| *created_at);
            }
            TaskEvent::Renamed { text } => self.text = text.clone(),
            TaskEvent::Completed { completed_at } => {
                self.completed = true;
                self.completed_at = Some(*completed_at);
            }
            TaskEvent::Reopened => {
                self.completed = false;
                self.completed_at = None;
            }
            TaskEvent::Moved {
                category_id,
                inherited_tags,
            } => {
                self.category_id = *category_id;
                self.inherited_tags = inherited_tags.clone();
            }
            TaskEvent::ManualTagsSet { tags } => self.manual_tags = tags.clone(),
            TaskEvent::InheritedTagsRefreshed { tags } => self.inherited_tags = tags.clone(),
            TaskEvent::Orphaned { .. } => self.orphaned = true,
            TaskEvent::LastSeen { seen_at } => self.last_seen_at = Some(*seen_at),
            TaskEvent::Deleted { .. } => self.deleted = true,
        }
    }

    fn decide(&self, command: &TaskCommand, now: i64) -> Result<Vec<TaskEvent>, DecideError> {
        match command {
            TaskCommand::Create {
                task_id,
                text,
                category_id,
                source,
                inherited_tags,
            } => {
                if self.id.is_some() {
                    return Err(DecideError::validation(format!(
                        "task already exists: {task_id}"
                    )));
                }
                let text = validate_text("task text", text, MAX_TASK_TEXT_CHARS)?;
                Ok(vec![TaskEvent::Created {
                    task_id: *task_id,
                    text,
                    category_id: *category_id,
                    source: source.clone(),
                    inherited_tags: inherited_tags.clone().unwrap_or_default(),
                    created_at: now,
                }])
            }
            _ if !self.exists() => Err(DecideError::NotFound),
            other => self.decide_existing(other, now),
        }
    }
}

impl TaskState {
    fn decide_existing(
        &self,
        command: &TaskCommand,
        now: i64,
    ) -> Result<Vec<TaskEvent>, DecideError> {
        let events = match command {
            TaskCommand::Create { task_id, .. } => {
                return Err(DecideError::validation(format!(
                    "task already exists: {task_id}"
                )))
            }
            TaskCommand::Rename { text } => {
                let text = validate_text("task text", text, MAX_TASK_TEXT_CHARS)?;
                if text == self.text {
                    vec![]
                } else {
                    vec![TaskEvent::Renamed { text }]
                }
            }
            TaskCommand::Complete if self.completed => vec![],
            TaskCommand::Complete => vec![TaskEvent::Completed { completed_at: now }],
            TaskCommand::Reopen if !self.completed => vec![],
            TaskCommand::Reopen => vec![TaskEvent::Reopened],
            TaskCommand::Delete => vec![TaskEvent::Deleted { deleted_at: now }],
            TaskCommand::Move {
                category_id,
                inherited_tags,
            } => {
                let inherited_tags = inherited_tags.clone().unwrap_or_default();
                if *category_id == self.category_id
                    && inherited_tags.same_members(&self.inherited_tags)
                {
                    vec![]
                } else {
                    vec![TaskEvent::Moved {
                        category_id: *category_id,
                        inherited_tags,
                    }]
                }
            }
            TaskCommand::SetTags { tags } => {
                let tags = validate_tags(tags)?;
                if tags == self.manual_tags {
                    vec![]
                } else {
                    vec![TaskEvent::ManualTagsSet { tags }]
                }
            }
            TaskCommand::MarkOrphaned { document_id } => {
                match &self.source {
                    Some(source) if source.document_id == *document_id => {}
                    _ => {
                        return Err(DecideError::validation(format!(
                            "task is not derived from document {document_id}"
                        )))
                    }
                }
                if self.orphaned {
                    vec![]
                } else {
                    vec![TaskEvent::Orphaned {
                        document_id: *document_id,
                        orphaned_at: now,
                    }]
                }
            }
            TaskCommand::Touch { seen_at } => {
                if self.orphaned || self.last_seen_at.is_some_and(|last| last >= *seen_at) {
                    vec![]
                } else {
                    vec![TaskEvent::LastSeen { seen_at: *seen_at }]
                }
            }
            TaskCommand::RefreshInheritedTags { category_id, tags } => {
                if *category_id != self.category_id || tags.same_members(&self.inherited_tags) {
                    vec![]
                } else {
                    vec![TaskEvent::InheritedTagsRefreshed { tags: tags.clone() }]
                }
            }
        };
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::{TaskCommand, TaskEvent, TaskSource, TaskState};
    use crate::aggregate::{replay, Aggregate, DecideError};
    use crate::model::tags::TagSet;
    use uuid::Uuid;

    fn created(source: Option<TaskSource>) -> TaskEvent {
        TaskEvent::Created {
            task_id: Uuid::new_v4(),
            text: "call Alice".to_string(),
            category_id: None,
            source,
            inherited_tags: TagSet::from_tags(["work"]),
            created_at: 10,
        }
    }

    fn extracted_source(document_id: Uuid) -> TaskSource {
        TaskSource {
            document_id,
            stable_id: "abc".to_string(),
            line_number: 3,
        }
    }

    #[test]
    fn commands_against_missing_task_are_not_found() {
        let state = TaskState::default();
        assert_eq!(
            state.decide(&TaskCommand::Complete, 1),
            Err(DecideError::NotFound)
        );
    }

    #[test]
    fn create_rejects_blank_text() {
        let state = TaskState::default();
        let err = state
            .decide(
                &TaskCommand::Create {
                    task_id: Uuid::new_v4(),
                    text: "   ".to_string(),
                    category_id: None,
                    source: None,
                    inherited_tags: None,
                },
                1,
            )
            .unwrap_err();
        assert!(matches!(err, DecideError::Validation(_)));
    }

    #[test]
    fn refresh_inherited_tags_keeps_manual_tags() {
        let mut state: TaskState = replay([&created(None)]);
        for event in state
            .decide(
                &TaskCommand::SetTags {
                    tags: vec!["Mine".to_string()],
                },
                2,
            )
            .unwrap()
        {
            state.apply(&event);
        }
        for event in state
            .decide(
                &TaskCommand::RefreshInheritedTags {
                    category_id: None,
                    tags: TagSet::from_tags(["home"]),
                },
                3,
            )
            .unwrap()
        {
            state.apply(&event);
        }

        assert_eq!(state.manual_tags.as_slice(), ["Mine".to_string()]);
        assert_eq!(state.inherited_tags.as_slice(), ["home".to_string()]);
        assert_eq!(
            state.visible_tags().as_slice(),
            ["Mine".to_string(), "home".to_string()]
        );
    }

    #[test]
    fn orphaning_keeps_text_and_tags_and_is_idempotent() {
        let document_id = Uuid::new_v4();
        let mut state: TaskState = replay([&created(Some(extracted_source(document_id)))]);
        let events = state
            .decide(&TaskCommand::MarkOrphaned { document_id }, 5)
            .unwrap();
        assert_eq!(events.len(), 1);
        state.apply(&events[0]);

        assert!(state.orphaned);
        assert_eq!(state.text, "call Alice");
        assert_eq!(state.inherited_tags.as_slice(), ["work".to_string()]);
        assert!(state
            .decide(&TaskCommand::MarkOrphaned { document_id }, 6)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn touch_is_a_no_op_for_already_seen_timestamps() {
        let mut state: TaskState = replay([&created(Some(extracted_source(Uuid::new_v4())))]);
        assert!(state
            .decide(&TaskCommand::Touch { seen_at: 10 }, 11)
            .unwrap()
            .is_empty());

        let events = state.decide(&TaskCommand::Touch { seen_at: 20 }, 21).unwrap();
        assert_eq!(events, vec![TaskEvent::LastSeen { seen_at: 20 }]);
        state.apply(&events[0]);
        assert!(state
            .decide(&TaskCommand::Touch { seen_at: 20 }, 22)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn refresh_resolved_for_a_previous_category_is_dropped() {
        let mut state: TaskState = replay([&created(None)]);
        let home = Uuid::new_v4();
        let events = state
            .decide(
                &TaskCommand::Move {
                    category_id: Some(home),
                    inherited_tags: Some(TagSet::from_tags(["home"])),
                },
                2,
            )
            .unwrap();
        state.apply(&events[0]);

        let stale = TaskCommand::RefreshInheritedTags {
            category_id: None,
            tags: TagSet::from_tags(["work", "urgent"]),
        };
        assert!(state.decide(&stale, 3).unwrap().is_empty());

        let current = TaskCommand::RefreshInheritedTags {
            category_id: Some(home),
            tags: TagSet::from_tags(["home", "errands"]),
        };
        assert_eq!(state.decide(&current, 4).unwrap().len(), 1);
    }

    #[test]
    fn complete_and_reopen_are_idempotent() {
        let mut state: TaskState = replay([&created(None)]);
        let events = state.decide(&TaskCommand::Complete, 2).unwrap();
        state.apply(&events[0]);
        assert!(state.decide(&TaskCommand::Complete, 3).unwrap().is_empty());
        let events = state.decide(&TaskCommand::Reopen, 4).unwrap();
        state.apply(&events[0]);
        assert!(!state.completed);
        assert!(state.decide(&TaskCommand::Reopen, 5).unwrap().is_empty());
    }
}
