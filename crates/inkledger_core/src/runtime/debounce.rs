//! Keyed trailing-edge debouncer.
//!
//! Time is passed in by the caller so the policy stays deterministic.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Keeps only the latest value per key and releases it once `window` has
/// passed without a newer value for that key.
#[derive(Debug)]
pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash + Clone, V> Debouncer<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records `value` for `key`, replacing and re-arming any pending value.
    /// Returns `true` when an earlier pending value was coalesced.
    pub fn push(&mut self, key: K, value: V, now: Instant) -> bool {
        self.pending
            .insert(key, (now + self.window, value))
            .is_some()
    }

    /// Removes and returns values whose window has elapsed, oldest deadline
    /// first.
    pub fn take_due(&mut self, now: Instant) -> Vec<V> {
        let mut due_keys: Vec<(Instant, K)> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(key, (deadline, _))| (*deadline, key.clone()))
            .collect();
        due_keys.sort_by_key(|(deadline, _)| *deadline);
        due_keys
            .into_iter()
            .filter_map(|(_, key)| self.pending.remove(&key).map(|(_, value)| value))
            .collect()
    }

    /// Removes and returns every pending value regardless of deadline.
    pub fn drain(&mut self) -> Vec<V> {
        let mut entries: Vec<(Instant, V)> = self.pending.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|(deadline, _)| *deadline);
        entries.into_iter().map(|(_, value)| value).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(deadline, _)| *deadline).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
