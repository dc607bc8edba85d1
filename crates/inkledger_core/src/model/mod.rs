//! Shared domain vocabulary: identifiers, stream naming, tags and time.
//!
//! # Invariants
//! - Every aggregate is identified by a stable UUID.
//! - A stream id is `<aggregate_type>-<uuid>` and maps to exactly one aggregate.

use uuid::Uuid;

pub mod tags;

pub type TaskId = Uuid;
pub type CategoryId = Uuid;
pub type DocumentId = Uuid;

/// Ancestor walks stop after this many levels unless configured otherwise.
pub const DEFAULT_MAX_HIERARCHY_DEPTH: usize = 20;

/// Builds the event stream id for one aggregate instance.
pub fn stream_id(aggregate_type: &str, id: Uuid) -> String {
    format!("{aggregate_type}-{id}")
}

/// Parses `<aggregate_type>-<uuid>` back into its aggregate id.
pub fn parse_stream_id(aggregate_type: &str, stream_id: &str) -> Option<Uuid> {
    let rest = stream_id.strip_prefix(aggregate_type)?.strip_prefix('-')?;
    Uuid::parse_str(rest).ok()
}

/// Current wall clock in Unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{parse_stream_id, stream_id};
    use uuid::Uuid;

    #[test]
    fn stream_id_round_trips_for_matching_type_only() {
        let id = Uuid::new_v4();
        let stream = stream_id("task", id);
        assert_eq!(parse_stream_id("task", &stream), Some(id));
        assert_eq!(parse_stream_id("category", &stream), None);
        assert_eq!(parse_stream_id("task", "task-1"), None);
    }
}
