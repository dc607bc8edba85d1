//! Aggregate replay and command decisions.
//!
//! # Responsibility
//! - Define the closed event/command vocabulary of each aggregate.
//! - Rebuild aggregate state by folding its stream (`replay`).
//! - Decide which events a command produces against current state.
//!
//! # Invariants
//! - `Aggregate::apply` is pure: no I/O, no clock, no randomness. Replaying
//!   the same events always yields identical state.
//! - `decide` never mutates state; it only returns events to append.
//! - Aggregates are built on demand and discarded; nothing here is cached.

pub mod category;
pub mod document;
pub mod task;

use crate::store::{
    ExpectedVersion, NewEvent, Snapshot, SqliteEventStore, StoreError, StoreResult, StoredEvent,
};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Event enums expose a stable type name stored in the `event_type` column.
pub trait EventKind {
    fn event_type(&self) -> &'static str;
}

/// A consistency boundary whose state is the fold of its own stream.
pub trait Aggregate: Default + Clone + Serialize + DeserializeOwned {
    type Event: Serialize + DeserializeOwned + Clone + Debug + EventKind;
    type Command: Debug;

    const AGGREGATE_TYPE: &'static str;

    /// Applies one event. Exactly one rule per event kind.
    fn apply(&mut self, event: &Self::Event);

    /// Returns the events `command` produces, or why it is rejected.
    ///
    /// `now` is the command timestamp in epoch milliseconds; it is copied into
    /// events rather than read during `apply`.
    fn decide(&self, command: &Self::Command, now: i64) -> Result<Vec<Self::Event>, DecideError>;
}

/// Why a command produced no events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecideError {
    #[error("{0}")]
    Validation(String),
    #[error("aggregate does not exist")]
    NotFound,
}

impl DecideError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Folds `events` into fresh state.
pub fn replay<'a, A>(events: impl IntoIterator<Item = &'a A::Event>) -> A
where
    A: Aggregate,
    A::Event: 'a,
{
    events.into_iter().fold(A::default(), |mut state, event| {
        state.apply(event);
        state
    })
}

/// Aggregate instance loaded for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRoot<A> {
    pub stream_id: String,
    /// Number of events folded into `state` (snapshot version included).
    pub version: u64,
    pub state: A,
}

impl<A: Aggregate> AggregateRoot<A> {
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            version: 0,
            state: A::default(),
        }
    }

    pub fn apply(&mut self, event: &A::Event) {
        self.state.apply(event);
        self.version += 1;
    }

    /// Expected version for the next append.
    pub fn expected_version(&self) -> ExpectedVersion {
        if self.version == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(self.version)
        }
    }
}

/// Serializes one event for the store.
pub fn encode_event<E: Serialize + EventKind>(event: &E) -> StoreResult<NewEvent> {
    let payload =
        serde_json::to_string(event).map_err(|err| StoreError::Serialization(err.to_string()))?;
    Ok(NewEvent {
        event_type: event.event_type().to_string(),
        payload,
    })
}

/// Deserializes one stored payload into a typed event.
pub fn decode_event<E: DeserializeOwned>(stored: &StoredEvent) -> StoreResult<E> {
    serde_json::from_str(&stored.payload).map_err(|err| StoreError::Deserialization {
        stream_id: stored.stream_id.clone(),
        sequence_number: stored.sequence_number,
        message: err.to_string(),
    })
}

/// Loads aggregates from the store, starting from a snapshot when one exists.
pub struct AggregateLoader<'s, 'conn> {
    store: &'s SqliteEventStore<'conn>,
}

impl<'s, 'conn> AggregateLoader<'s, 'conn> {
    pub fn new(store: &'s SqliteEventStore<'conn>) -> Self {
        Self { store }
    }

    /// Loads the aggregate stored under `stream_id`. A missing stream yields
    /// an empty root at version 0.
    pub fn load<A: Aggregate>(&self, stream_id: &str) -> StoreResult<AggregateRoot<A>> {
        let mut root = self
            .snapshot_root::<A>(stream_id)?
            .unwrap_or_else(|| AggregateRoot::empty(stream_id));

        let after = (root.version > 0).then_some(root.version);
        for stored in self.store.load(stream_id, after)? {
            if stored.aggregate_type != A::AGGREGATE_TYPE {
                return Err(StoreError::AggregateTypeMismatch {
                    stream_id: stream_id.to_string(),
                    expected: A::AGGREGATE_TYPE.to_string(),
                    actual: stored.aggregate_type,
                });
            }
            let event: A::Event = decode_event(&stored)?;
            root.apply(&event);
            if root.version != stored.sequence_number {
                return Err(StoreError::InvalidData(format!(
                    "stream `{stream_id}` has a sequence gap at {}",
                    stored.sequence_number
                )));
            }
        }
        Ok(root)
    }

    /// Persists the current state of `root` as its snapshot.
    pub fn save_snapshot<A: Aggregate>(&self, root: &AggregateRoot<A>) -> StoreResult<()> {
        let state = serde_json::to_string(&root.state)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.store.save_snapshot(&Snapshot {
            stream_id: root.stream_id.clone(),
            version: root.version,
            state,
        })
    }

    fn snapshot_root<A: Aggregate>(
        &self,
        stream_id: &str,
    ) -> StoreResult<Option<AggregateRoot<A>>> {
        let Some(snapshot) = self.store.load_snapshot(stream_id)? else {
            return Ok(None);
        };
        match serde_json::from_str::<A>(&snapshot.state) {
            Ok(state) => Ok(Some(AggregateRoot {
                stream_id: stream_id.to_string(),
                version: snapshot.version,
                state,
            })),
            Err(err) => {
                warn!(
                    "event=snapshot_decode module=aggregate status=ignored stream_id={} version={} error={}",
                    stream_id, snapshot.version, err
                );
                Ok(None)
            }
        }
    }
}

/// Trims a required text field and enforces a maximum length in characters.
pub(crate) fn validate_text(
    field: &str,
    value: &str,
    max_chars: usize,
) -> Result<String, DecideError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DecideError::validation(format!("{field} must not be blank")));
    }
    if trimmed.chars().count() > max_chars {
        return Err(DecideError::validation(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Rejects tag lists containing blank values, then normalizes them.
pub(crate) fn validate_tags(tags: &[String]) -> Result<crate::model::tags::TagSet, DecideError> {
    if let Some(blank) = tags.iter().find(|tag| tag.trim().is_empty()) {
        return Err(DecideError::validation(format!("invalid tag: `{blank}`")));
    }
    Ok(crate::model::tags::TagSet::from_tags(tags))
}
