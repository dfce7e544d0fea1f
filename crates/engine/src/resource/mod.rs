//! Resource declarations, relationships, hooks and the registry

pub mod definition;
pub mod hooks;
pub mod registry;
pub mod relationship;

pub use definition::{ComputeContext, ComputedField, Resource, ResourceDefinition};
pub use hooks::{Hook, HookEvent, HookKind, HookResult, HookSet};
pub use registry::{RegistryStats, ResourceRegistry};
pub use relationship::{Cardinality, Relationship, RelationshipKind, Through};
