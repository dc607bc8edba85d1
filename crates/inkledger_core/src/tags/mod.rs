//! Container tag inheritance.
//!
//! # Responsibility
//! - Resolve inherited tags by walking the category hierarchy.
//! - Push hierarchy changes down to existing tasks in the background.
//!
//! # Invariants
//! - Ancestor walks are bounded by `max_depth` and stop on cycles.
//! - Only `inherited_tags` is recomputed; manual tags are left alone.

mod propagation;
mod resolver;

pub use propagation::{
    PropagationJob, PropagationOptions, PropagationReport, PropagationRunner, PropagationSink,
    TagPropagator, DEFAULT_PROPAGATION_BATCH_SIZE, DEFAULT_PROPAGATION_DELAY,
};
pub use resolver::{
    CategoryNode, DocumentNode, HierarchySource, InMemoryHierarchy, TagInheritanceResolver,
};
