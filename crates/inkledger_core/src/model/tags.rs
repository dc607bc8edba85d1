//! Case-insensitive tag sets.
//!
//! # Invariants
//! - Stored tags are trimmed and never blank.
//! - Two tags that differ only by case are the same tag; the first spelling
//!   inserted is kept.
//! - Iteration order is insertion order, so unions are deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Normalizes one tag value. Returns `None` for blank input.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Comparison key used for case-insensitive de-duplication.
pub fn tag_key(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Ordered set of tags with case-insensitive membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(Vec<String>);

impl TagSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builds a set from raw values, dropping blanks and case duplicates.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for tag in tags {
            set.insert(tag.as_ref());
        }
        set
    }

    /// Inserts one tag. Returns `false` when blank or already present.
    pub fn insert(&mut self, tag: &str) -> bool {
        let Some(normalized) = normalize_tag(tag) else {
            return false;
        };
        if self.contains(&normalized) {
            return false;
        }
        self.0.push(normalized);
        true
    }

    pub fn extend_from(&mut self, other: &TagSet) {
        for tag in &other.0 {
            self.insert(tag);
        }
    }

    /// Returns `self ∪ other`, keeping `self` spellings first.
    pub fn union(&self, other: &TagSet) -> TagSet {
        let mut merged = self.clone();
        merged.extend_from(other);
        merged
    }

    pub fn contains(&self, tag: &str) -> bool {
        let key = tag_key(tag);
        self.0.iter().any(|existing| tag_key(existing) == key)
    }

    /// Order-insensitive, case-insensitive equality.
    pub fn same_members(&self, other: &TagSet) -> bool {
        self.keys() == other.keys()
    }

    pub fn is_superset_of(&self, other: &TagSet) -> bool {
        other.0.iter().all(|tag| self.contains(tag))
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.0.iter().map(|tag| tag_key(tag)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::from_tags(iter)
    }
}
