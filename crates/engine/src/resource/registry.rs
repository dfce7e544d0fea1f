//! Resource Registry - name to definition lookup shared by every component

use super::definition::{Resource, ResourceDefinition};
use super::relationship::{Relationship, RelationshipKind};
use crate::error::{EngineError, EngineResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe registry of resources
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: Arc<DashMap<String, Arc<Resource>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a resource.
    ///
    /// Relationship targets may be registered later; unresolved ones are only
    /// logged here and reported by [`validate_all_relationships`].
    ///
    /// [`validate_all_relationships`]: ResourceRegistry::validate_all_relationships
    pub fn register(&self, definition: ResourceDefinition) -> EngineResult<Arc<Resource>> {
        let resource = Arc::new(definition.into_resource()?);

        match self.resources.entry(resource.name().to_string()) {
            Entry::Occupied(entry) => {
                return Err(EngineError::DuplicateResource(entry.key().clone()));
            }
            Entry::Vacant(entry) => {
                entry.insert(resource.clone());
            }
        }

        for (name, relationship) in resource.relationships() {
            if !self.contains(relationship.target()) {
                tracing::warn!(
                    resource = resource.name(),
                    relationship = name,
                    target = relationship.target(),
                    "relationship target is not registered yet"
                );
            }
        }

        tracing::debug!(
            resource = resource.name(),
            table = resource.table(),
            relationships = resource.relationship_count(),
            "resource registered"
        );
        Ok(resource)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }

    /// Like [`get`](ResourceRegistry::get) but failing with `UnknownResource`
    pub fn require(&self, name: &str) -> EngineResult<Arc<Resource>> {
        self.get(name)
            .ok_or_else(|| EngineError::UnknownResource(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Storage table for a resource. Unregistered names (join tables) map to
    /// themselves.
    pub fn table_name(&self, name: &str) -> String {
        self.get(name)
            .map(|resource| resource.table().to_string())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn relationship(&self, resource: &str, name: &str) -> EngineResult<Relationship> {
        self.require(resource)?
            .relationship(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRelationship {
                resource: resource.to_string(),
                relationship: name.to_string(),
            })
    }

    /// Fails with every relationship whose target is not registered
    pub fn validate_all_relationships(&self) -> EngineResult<()> {
        let mut unresolved = Vec::new();
        for name in self.names() {
            let Some(resource) = self.get(&name) else {
                continue;
            };
            for (rel_name, relationship) in resource.relationships() {
                if !self.contains(relationship.target()) {
                    unresolved.push(format!("{}.{} -> {}", name, rel_name, relationship.target()));
                }
            }
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(EngineError::UnresolvedRelationships(unresolved))
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let mut relationship_kind_counts = HashMap::new();
        let mut total_relationships = 0;
        let mut computed_fields = 0;

        for entry in self.resources.iter() {
            for (_, relationship) in entry.value().relationships() {
                total_relationships += 1;
                *relationship_kind_counts.entry(relationship.kind()).or_insert(0) += 1;
            }
            computed_fields += entry.value().computed_fields().count();
        }

        RegistryStats {
            total_resources: self.resources.len(),
            total_relationships,
            computed_fields,
            relationship_kind_counts,
        }
    }

    /// Remove every registered resource
    pub fn clear(&self) {
        self.resources.clear();
    }
}

/// Statistics about the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStats {
    pub total_resources: usize,
    pub total_relationships: usize,
    pub computed_fields: usize,
    pub relationship_kind_counts: HashMap<RelationshipKind, usize>,
}
