//! Subscriptions to the entities of a resource

use super::{Fold, Gate, Subscription, SubscriptionManager};
use crate::error::EngineResult;
use crate::events::{channels, EventKind, ResourceEvent};
use crate::selection::QueryOptions;
use crate::value::{entity_id, merge_into};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Options for [`SubscriptionManager::subscribe_list`]
#[derive(Debug, Clone, Default)]
pub struct ListSubscribeOptions {
    /// Equality filters an entity must match to be in the list
    pub filter: QueryOptions,
    /// Do not emit the empty starting list
    pub skip_initial: bool,
    pub debounce: Option<Duration>,
    pub buffer: Option<Duration>,
}

impl ListSubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter = self.filter.filter(field, value);
        self
    }

    pub fn skip_initial(mut self) -> Self {
        self.skip_initial = true;
        self
    }

    pub fn debounce(mut self, period: Duration) -> Self {
        self.debounce = Some(period);
        self
    }

    pub fn buffer(mut self, window: Duration) -> Self {
        self.buffer = Some(window);
        self
    }
}

pub(crate) struct ListFold {
    resource: String,
    filter: QueryOptions,
    items: Vec<Value>,
}

impl ListFold {
    fn position(&self, id: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| entity_id(item).as_deref() == Some(id))
    }
}

#[async_trait]
impl Fold for ListFold {
    type Output = Vec<Value>;

    fn is_relevant(&self, event: &ResourceEvent) -> bool {
        event.resource == self.resource
    }

    async fn apply(&mut self, event: ResourceEvent) -> EngineResult<bool> {
        match event.kind {
            EventKind::Created { entity } => {
                let known = entity_id(&entity).and_then(|id| self.position(&id)).is_some();
                if known || !self.filter.matches(&entity) {
                    return Ok(false);
                }
                self.items.push(entity);
                Ok(true)
            }
            EventKind::Updated { id, changes, .. } => match self.position(&id) {
                Some(index) => {
                    merge_into(&mut self.items[index], &changes);
                    if !self.filter.matches(&self.items[index]) {
                        self.items.remove(index);
                    }
                    Ok(true)
                }
                None => Ok(false),
            },
            EventKind::Deleted { id } => match self.position(&id) {
                Some(index) => {
                    self.items.remove(index);
                    Ok(true)
                }
                None => Ok(false),
            },
            EventKind::RelationshipAdded { .. } | EventKind::RelationshipRemoved { .. } => Ok(false),
        }
    }

    fn snapshot(&self) -> Vec<Value> {
        self.items.clone()
    }
}

impl SubscriptionManager {
    /// Subscribes to the entities of `resource` created, updated or deleted
    /// from now on.
    ///
    /// The list starts empty and only grows on `created` events: entities
    /// that existed before the subscription never appear, even when updated.
    pub async fn subscribe_list(
        &self,
        resource: &str,
        options: ListSubscribeOptions,
    ) -> EngineResult<Subscription<Vec<Value>>> {
        self.registry().require(resource)?;
        let streams = vec![self.bus().subscribe(&channels::global(resource)).await?];

        let fold = ListFold {
            resource: resource.to_string(),
            filter: options.filter,
            items: Vec::new(),
        };
        let initial = (!options.skip_initial).then(Vec::new);
        let gate = Gate::from_options(options.debounce, options.buffer);

        tracing::debug!(resource, "list subscription");
        Ok(self.start(fold, streams, initial, gate))
    }
}
