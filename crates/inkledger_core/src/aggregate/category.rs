//! Category aggregate: one folder-like container in the task hierarchy.
//!
//! # Invariants
//! - Names are trimmed, non-blank and contain no `/` (paths are built from
//!   names joined with `/`).
//! - Parent existence and cycle checks need the whole hierarchy and are done
//!   by the command bus before `decide`.

use super::{validate_tags, validate_text, Aggregate, DecideError, EventKind};
use crate::model::tags::TagSet;
use crate::model::CategoryId;
use serde::{Deserialize, Serialize};

pub const CATEGORY_AGGREGATE: &str = "category";
pub const MAX_CATEGORY_NAME_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CategoryEvent {
    Created {
        category_id: CategoryId,
        name: String,
        parent_id: Option<CategoryId>,
        tags: TagSet,
        inherit_to_children: bool,
    },
    Renamed {
        name: String,
    },
    Moved {
        parent_id: Option<CategoryId>,
    },
    TagsSet {
        tags: TagSet,
    },
    InheritanceSet {
        inherit_to_children: bool,
    },
    Deleted,
}

impl EventKind for CategoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "category_created",
            Self::Renamed { .. } => "category_renamed",
            Self::Moved { .. } => "category_moved",
            Self::TagsSet { .. } => "category_tags_set",
            Self::InheritanceSet { .. } => "category_inheritance_set",
            Self::Deleted => "category_deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryCommand {
    Create {
        category_id: CategoryId,
        name: String,
        parent_id: Option<CategoryId>,
        tags: Vec<String>,
        inherit_to_children: bool,
    },
    Rename {
        name: String,
    },
    Move {
        parent_id: Option<CategoryId>,
    },
    SetTags {
        tags: Vec<String>,
    },
    SetInheritance {
        inherit_to_children: bool,
    },
    Delete,
}

impl CategoryCommand {
    /// Whether applying this command can change tags inherited below it.
    pub fn affects_inheritance(&self) -> bool {
        matches!(
            self,
            Self::Move { .. } | Self::SetTags { .. } | Self::SetInheritance { .. } | Self::Delete
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryState {
    pub id: Option<CategoryId>,
    pub name: String,
    pub parent_id: Option<CategoryId>,
    pub tags: TagSet,
    pub inherit_to_children: bool,
    pub deleted: bool,
}

impl CategoryState {
    pub fn exists(&self) -> bool {
        self.id.is_some() && !self.deleted
    }
}

fn validate_name(name: &str) -> Result<String, DecideError> {
    let name = validate_text("category name", name, MAX_CATEGORY_NAME_CHARS)?;
    if name.contains('/') {
        return Err(DecideError::validation("category name must not contain `/`"));
    }
    Ok(name)
}

impl Aggregate for CategoryState {
    type Event = CategoryEvent;
    type Command = CategoryCommand;

    const AGGREGATE_TYPE: &'static str = CATEGORY_AGGREGATE;

    fn apply(&mut self, event: &CategoryEvent) {
        match event {
            CategoryEvent::Created {
                category_id,
                name,
                parent_id,
                tags,
                inherit_to_children,
            } => {
                self.id = Some(*category_id);
                self.name = name.clone();
                self.parent_id = *parent_id;
                self.tags = tags.clone();
                self.inherit_to_children = *inherit_to_children;
            }
            CategoryEvent::Renamed { name } => self.name = name.clone(),
            CategoryEvent::Moved { parent_id } => self.parent_id = *parent_id,
            CategoryEvent::TagsSet { tags } => self.tags = tags.clone(),
            CategoryEvent::InheritanceSet {
                inherit_to_children,
            } => self.inherit_to_children = *inherit_to_children,
            CategoryEvent::Deleted => self.deleted = true,
        }
    }

    fn decide(
        &self,
        command: &CategoryCommand,
        _now: i64,
    ) -> Result<Vec<CategoryEvent>, DecideError> {
        if let CategoryCommand::Create {
            category_id,
            name,
            parent_id,
            tags,
            inherit_to_children,
        } = command
        {
            if self.id.is_some() {
                return Err(DecideError::validation(format!(
                    "category already exists: {category_id}"
                )));
            }
            if *parent_id == Some(*category_id) {
                return Err(DecideError::validation("category cannot be its own parent"));
            }
            return Ok(vec![CategoryEvent::Created {
                category_id: *category_id,
                name: validate_name(name)?,
                parent_id: *parent_id,
                tags: validate_tags(tags)?,
                inherit_to_children: *inherit_to_children,
            }]);
        }

        if !self.exists() {
            return Err(DecideError::NotFound);
        }

        let events = match command {
            CategoryCommand::Create { category_id, .. } => {
                return Err(DecideError::validation(format!(
                    "category already exists: {category_id}"
                )))
            }
            CategoryCommand::Rename { name } => {
                let name = validate_name(name)?;
                if name == self.name {
                    vec![]
                } else {
                    vec![CategoryEvent::Renamed { name }]
                }
            }
            CategoryCommand::Move { parent_id } => {
                if *parent_id == self.id {
                    return Err(DecideError::validation("category cannot be its own parent"));
                }
                if *parent_id == self.parent_id {
                    vec![]
                } else {
                    vec![CategoryEvent::Moved {
                        parent_id: *parent_id,
                    }]
                }
            }
            CategoryCommand::SetTags { tags } => {
                let tags = validate_tags(tags)?;
                if tags == self.tags {
                    vec![]
                } else {
                    vec![CategoryEvent::TagsSet { tags }]
                }
            }
            CategoryCommand::SetInheritance {
                inherit_to_children,
            } => {
                if *inherit_to_children == self.inherit_to_children {
                    vec![]
                } else {
                    vec![CategoryEvent::InheritanceSet {
                        inherit_to_children: *inherit_to_children,
                    }]
                }
            }
            CategoryCommand::Delete => vec![CategoryEvent::Deleted],
        };
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::{CategoryCommand, CategoryState};
    use crate::aggregate::{replay, Aggregate, DecideError};
    use uuid::Uuid;

    fn create(name: &str) -> CategoryCommand {
        CategoryCommand::Create {
            category_id: Uuid::new_v4(),
            name: name.to_string(),
            parent_id: None,
            tags: vec!["Work".to_string(), "work".to_string()],
            inherit_to_children: true,
        }
    }

    #[test]
    fn create_normalizes_tags_and_rejects_path_separators() {
        let state = CategoryState::default();
        let events = state.decide(&create(" Projects "), 0).unwrap();
        let built: CategoryState = replay(events.iter());
        assert_eq!(built.name, "Projects");
        assert_eq!(built.tags.as_slice(), ["Work".to_string()]);

        let err = state.decide(&create("a/b"), 0).unwrap_err();
        assert!(matches!(err, DecideError::Validation(_)));
    }

    #[test]
    fn move_under_itself_is_rejected() {
        let events = CategoryState::default().decide(&create("A"), 0).unwrap();
        let state: CategoryState = replay(events.iter());
        let err = state
            .decide(
                &CategoryCommand::Move {
                    parent_id: state.id,
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, DecideError::Validation(_)));
    }

    #[test]
    fn toggling_inheritance_to_current_value_is_a_no_op() {
        let events = CategoryState::default().decide(&create("A"), 0).unwrap();
        let state: CategoryState = replay(events.iter());
        assert!(state
            .decide(
                &CategoryCommand::SetInheritance {
                    inherit_to_children: true
                },
                0
            )
            .unwrap()
            .is_empty());
    }
}
