//! Document aggregate: a rich-text file that tasks are extracted from.
//!
//! A removed document that is registered again is restored with the tags it
//! had before removal.

use super::{validate_tags, validate_text, Aggregate, DecideError, EventKind};
use crate::model::tags::TagSet;
use crate::model::{CategoryId, DocumentId};
use serde::{Deserialize, Serialize};

pub const DOCUMENT_AGGREGATE: &str = "document";
const MAX_PATH_CHARS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentEvent {
    Registered {
        document_id: DocumentId,
        file_path: String,
        category_id: Option<CategoryId>,
    },
    Relocated {
        file_path: String,
    },
    Moved {
        category_id: Option<CategoryId>,
    },
    TagsSet {
        tags: TagSet,
    },
    Removed,
    Restored {
        file_path: String,
        category_id: Option<CategoryId>,
        tags: TagSet,
    },
}

impl EventKind for DocumentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "document_registered",
            Self::Relocated { .. } => "document_relocated",
            Self::Moved { .. } => "document_moved",
            Self::TagsSet { .. } => "document_tags_set",
            Self::Removed => "document_removed",
            Self::Restored { .. } => "document_restored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentCommand {
    Register {
        document_id: DocumentId,
        file_path: String,
        category_id: Option<CategoryId>,
    },
    Relocate {
        file_path: String,
    },
    Move {
        category_id: Option<CategoryId>,
    },
    SetTags {
        tags: Vec<String>,
    },
    Remove,
}

impl DocumentCommand {
    pub fn affects_inheritance(&self) -> bool {
        matches!(self, Self::Move { .. } | Self::SetTags { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub id: Option<DocumentId>,
    pub file_path: String,
    pub category_id: Option<CategoryId>,
    pub tags: TagSet,
    pub removed: bool,
}

impl DocumentState {
    pub fn exists(&self) -> bool {
        self.id.is_some() && !self.removed
    }
}

impl Aggregate for DocumentState {
    type Event = DocumentEvent;
    type Command = DocumentCommand;

    const AGGREGATE_TYPE: &'static str = DOCUMENT_AGGREGATE;

    fn apply(&mut self, event: &DocumentEvent) {
        match event {
            DocumentEvent::Registered {
                document_id,
                file_path,
                category_id,
            } => {
                self.id = Some(*document_id);
                self.file_path = file_path.clone();
                self.category_id = *category_id;
            }
            DocumentEvent::Relocated { file_path } => self.file_path = file_path.clone(),
            DocumentEvent::Moved { category_id } => self.category_id = *category_id,
            DocumentEvent::TagsSet { tags } => self.tags = tags.clone(),
            DocumentEvent::Removed => self.removed = true,
            DocumentEvent::Restored {
                file_path,
                category_id,
                tags,
            } => {
                self.file_path = file_path.clone();
                self.category_id = *category_id;
                self.tags = tags.clone();
                self.removed = false;
            }
        }
    }

    fn decide(
        &self,
        command: &DocumentCommand,
        _now: i64,
    ) -> Result<Vec<DocumentEvent>, DecideError> {
        if let DocumentCommand::Register {
            document_id,
            file_path,
            category_id,
        } = command
        {
            let file_path = validate_text("file path", file_path, MAX_PATH_CHARS)?;
            return match self.id {
                None => Ok(vec![DocumentEvent::Registered {
                    document_id: *document_id,
                    file_path,
                    category_id: *category_id,
                }]),
                Some(_) if self.removed => Ok(vec![DocumentEvent::Restored {
                    file_path,
                    category_id: *category_id,
                    tags: self.tags.clone(),
                }]),
                Some(_) => Err(DecideError::validation(format!(
                    "document already registered: {document_id}"
                ))),
            };
        }

        if !self.exists() {
            return Err(DecideError::NotFound);
        }

        let events = match command {
            DocumentCommand::Register { document_id, .. } => {
                return Err(DecideError::validation(format!(
                    "document already registered: {document_id}"
                )))
            }
            DocumentCommand::Relocate { file_path } => {
                let file_path = validate_text("file path", file_path, MAX_PATH_CHARS)?;
                if file_path == self.file_path {
                    vec![]
                } else {
                    vec![DocumentEvent::Relocated { file_path }]
                }
            }
            DocumentCommand::Move { category_id } if *category_id == self.category_id => vec![],
            DocumentCommand::Move { category_id } => vec![DocumentEvent::Moved {
                category_id: *category_id,
            }],
            DocumentCommand::SetTags { tags } => {
                let tags = validate_tags(tags)?;
                if tags == self.tags {
                    vec![]
                } else {
                    vec![DocumentEvent::TagsSet { tags }]
                }
            }
            DocumentCommand::Remove => vec![DocumentEvent::Removed],
        };
        Ok(events)
    }
}
