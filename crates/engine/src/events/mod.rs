//! Resource change events and the bus they travel on
//!
//! Mutations publish to two kinds of channel: the global channel named after
//! the resource (`message`) and the per-entity channel `message:<id>`.
//! Creates go to the global channel only; updates, deletes and relationship
//! changes go to both.

use crate::value::entity_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod bus;
pub mod memory;

pub use bus::{EventBus, EventStream};
pub use memory::MemoryEventBus;

/// Channel names
pub mod channels {
    /// Every event of a resource
    pub fn global(resource: &str) -> String {
        resource.to_string()
    }

    /// Events about one entity
    pub fn entity(resource: &str, id: &str) -> String {
        format!("{}:{}", resource, id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "resource:created")]
    Created { entity: Value },

    #[serde(rename = "resource:updated")]
    Updated {
        id: String,
        changes: Map<String, Value>,
        entity: Value,
    },

    #[serde(rename = "resource:deleted")]
    Deleted { id: String },

    #[serde(rename = "relationship:added", rename_all = "camelCase")]
    RelationshipAdded {
        parent_id: String,
        relationship: String,
        child_id: String,
    },

    #[serde(rename = "relationship:removed", rename_all = "camelCase")]
    RelationshipRemoved {
        parent_id: String,
        relationship: String,
        child_id: String,
    },
}

/// A change to a resource, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    /// Unique per published event; the same event seen on two channels
    /// carries the same id
    pub event_id: Uuid,
    pub resource: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ResourceEvent {
    pub fn new(resource: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            resource: resource.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn created(resource: impl Into<String>, entity: Value) -> Self {
        Self::new(resource, EventKind::Created { entity })
    }

    pub fn updated(
        resource: impl Into<String>,
        id: impl Into<String>,
        changes: Map<String, Value>,
        entity: Value,
    ) -> Self {
        Self::new(
            resource,
            EventKind::Updated {
                id: id.into(),
                changes,
                entity,
            },
        )
    }

    pub fn deleted(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(resource, EventKind::Deleted { id: id.into() })
    }

    pub fn relationship_added(
        resource: impl Into<String>,
        parent_id: impl Into<String>,
        relationship: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self::new(
            resource,
            EventKind::RelationshipAdded {
                parent_id: parent_id.into(),
                relationship: relationship.into(),
                child_id: child_id.into(),
            },
        )
    }

    pub fn relationship_removed(
        resource: impl Into<String>,
        parent_id: impl Into<String>,
        relationship: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self::new(
            resource,
            EventKind::RelationshipRemoved {
                parent_id: parent_id.into(),
                relationship: relationship.into(),
                child_id: child_id.into(),
            },
        )
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::Created { .. } => "resource:created",
            EventKind::Updated { .. } => "resource:updated",
            EventKind::Deleted { .. } => "resource:deleted",
            EventKind::RelationshipAdded { .. } => "relationship:added",
            EventKind::RelationshipRemoved { .. } => "relationship:removed",
        }
    }

    /// The entity this event is about; the parent for relationship events
    pub fn entity_id(&self) -> Option<String> {
        match &self.kind {
            EventKind::Created { entity } => entity_id(entity),
            EventKind::Updated { id, .. } | EventKind::Deleted { id } => Some(id.clone()),
            EventKind::RelationshipAdded { parent_id, .. }
            | EventKind::RelationshipRemoved { parent_id, .. } => Some(parent_id.clone()),
        }
    }

    /// Channels a mutation publishes this event to
    pub fn channels(&self) -> Vec<String> {
        let global = channels::global(&self.resource);
        match (&self.kind, self.entity_id()) {
            (EventKind::Created { .. }, _) | (_, None) => vec![global],
            (_, Some(id)) => vec![channels::entity(&self.resource, &id), global],
        }
    }
}
