//! Inherited tag computation over the container hierarchy.
//!
//! # Invariants
//! - Ancestor tags are collected root-first and only from ancestors with
//!   `inherit_to_children = true`.
//! - The node's own tags are always included, then the document's tags.
//! - Walks stop at `max_depth` ancestors or on the first revisited node.

use crate::model::tags::TagSet;
use crate::model::{CategoryId, DocumentId, DEFAULT_MAX_HIERARCHY_DEPTH};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;

/// Hierarchy data needed to resolve one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryNode {
    pub id: CategoryId,
    pub parent_id: Option<CategoryId>,
    pub tags: TagSet,
    pub inherit_to_children: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentNode {
    pub id: DocumentId,
    pub category_id: Option<CategoryId>,
    pub tags: TagSet,
}

/// Read access to categories and documents.
pub trait HierarchySource {
    type Error;

    fn category_node(&self, id: CategoryId) -> Result<Option<CategoryNode>, Self::Error>;
    fn document_node(&self, id: DocumentId) -> Result<Option<DocumentNode>, Self::Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct TagInheritanceResolver {
    max_depth: usize,
}

impl Default for TagInheritanceResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HIERARCHY_DEPTH)
    }
}

impl TagInheritanceResolver {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Tags inherited by items filed directly under `category_id`.
    ///
    /// A missing category resolves to the empty set.
    pub fn resolve_category<S: HierarchySource>(
        &self,
        source: &S,
        category_id: CategoryId,
    ) -> Result<TagSet, S::Error> {
        let Some(node) = source.category_node(category_id)? else {
            return Ok(TagSet::new());
        };

        let mut visited = HashSet::from([node.id]);
        let mut ancestors = Vec::new();
        let mut next = node.parent_id;
        while let Some(parent_id) = next {
            if ancestors.len() >= self.max_depth {
                warn!(
                    "event=tag_resolve module=tags status=depth_limit category_id={} max_depth={}",
                    category_id, self.max_depth
                );
                break;
            }
            if !visited.insert(parent_id) {
                warn!(
                    "event=tag_resolve module=tags status=cycle category_id={} at={}",
                    category_id, parent_id
                );
                break;
            }
            let Some(parent) = source.category_node(parent_id)? else {
                break;
            };
            next = parent.parent_id;
            ancestors.push(parent);
        }

        let mut resolved = TagSet::new();
        for ancestor in ancestors.iter().rev() {
            if ancestor.inherit_to_children {
                resolved.extend_from(&ancestor.tags);
            }
        }
        resolved.extend_from(&node.tags);
        Ok(resolved)
    }

    /// Tags inherited by a task filed under `category_id`, optionally derived
    /// from `document_id`.
    pub fn resolve_task<S: HierarchySource>(
        &self,
        source: &S,
        category_id: Option<CategoryId>,
        document_id: Option<DocumentId>,
    ) -> Result<TagSet, S::Error> {
        let mut resolved = match category_id {
            Some(category_id) => self.resolve_category(source, category_id)?,
            None => TagSet::new(),
        };
        if let Some(document_id) = document_id {
            if let Some(document) = source.document_node(document_id)? {
                resolved.extend_from(&document.tags);
            }
        }
        Ok(resolved)
    }
}

/// Hierarchy held in memory, for planning and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHierarchy {
    categories: HashMap<CategoryId, CategoryNode>,
    documents: HashMap<DocumentId, DocumentNode>,
}

impl InMemoryHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_category(&mut self, node: CategoryNode) {
        self.categories.insert(node.id, node);
    }

    pub fn insert_document(&mut self, node: DocumentNode) {
        self.documents.insert(node.id, node);
    }
}

impl HierarchySource for InMemoryHierarchy {
    type Error = Infallible;

    fn category_node(&self, id: CategoryId) -> Result<Option<CategoryNode>, Infallible> {
        Ok(self.categories.get(&id).cloned())
    }

    fn document_node(&self, id: DocumentId) -> Result<Option<DocumentNode>, Infallible> {
        Ok(self.documents.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{CategoryNode, DocumentNode, InMemoryHierarchy, TagInheritanceResolver};
    use crate::model::tags::TagSet;
    use uuid::Uuid;

    fn category(
        parent_id: Option<Uuid>,
        tags: &[&str],
        inherit_to_children: bool,
    ) -> CategoryNode {
        CategoryNode {
            id: Uuid::new_v4(),
            parent_id,
            tags: TagSet::from_tags(tags),
            inherit_to_children,
        }
    }

    #[test]
    fn ancestors_are_root_first_and_respect_inheritance_flag() {
        let mut hierarchy = InMemoryHierarchy::new();
        let root = category(None, &["work"], true);
        let silent = category(Some(root.id), &["private"], false);
        let leaf = category(Some(silent.id), &["urgent", "WORK"], true);
        for node in [&root, &silent, &leaf] {
            hierarchy.insert_category(node.clone());
        }

        let resolved = TagInheritanceResolver::default()
            .resolve_category(&hierarchy, leaf.id)
            .unwrap();
        assert_eq!(
            resolved.as_slice(),
            ["work".to_string(), "urgent".to_string()]
        );
    }

    #[test]
    fn cycles_terminate() {
        let mut hierarchy = InMemoryHierarchy::new();
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        hierarchy.insert_category(CategoryNode {
            id: a_id,
            parent_id: Some(b_id),
            tags: TagSet::from_tags(["a"]),
            inherit_to_children: true,
        });
        hierarchy.insert_category(CategoryNode {
            id: b_id,
            parent_id: Some(a_id),
            tags: TagSet::from_tags(["b"]),
            inherit_to_children: true,
        });

        let resolved = TagInheritanceResolver::default()
            .resolve_category(&hierarchy, a_id)
            .unwrap();
        assert_eq!(resolved.as_slice(), ["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn depth_limit_drops_distant_ancestors() {
        let mut hierarchy = InMemoryHierarchy::new();
        let root = category(None, &["far"], true);
        let middle = category(Some(root.id), &["near"], true);
        let leaf = category(Some(middle.id), &[], true);
        for node in [&root, &middle, &leaf] {
            hierarchy.insert_category(node.clone());
        }

        let resolved = TagInheritanceResolver::new(1)
            .resolve_category(&hierarchy, leaf.id)
            .unwrap();
        assert_eq!(resolved.as_slice(), ["near".to_string()]);
    }

    #[test]
    fn document_tags_come_last() {
        let mut hierarchy = InMemoryHierarchy::new();
        let root = category(None, &["work"], true);
        hierarchy.insert_category(root.clone());
        let document_id = Uuid::new_v4();
        hierarchy.insert_document(DocumentNode {
            id: document_id,
            category_id: Some(root.id),
            tags: TagSet::from_tags(["meeting", "Work"]),
        });

        let resolved = TagInheritanceResolver::default()
            .resolve_task(&hierarchy, Some(root.id), Some(document_id))
            .unwrap();
        assert_eq!(
            resolved.as_slice(),
            ["work".to_string(), "meeting".to_string()]
        );
    }
}
