//! Subscriptions to a single entity

use super::{Fold, Gate, Subscription, SubscriptionManager, SubscriptionState};
use crate::error::EngineResult;
use crate::events::{channels, EventKind, ResourceEvent};
use crate::loading::optimizer::executor::resolve_into;
use crate::loading::BatchLoader;
use crate::selection::SelectionSet;
use crate::value::merge_into;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Options for [`SubscriptionManager::subscribe`]
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Do not emit the current value first
    pub skip_initial: bool,
    /// Relationships to load, and reload when they change
    pub include: Option<SelectionSet>,
    /// Emit only after this long without further events
    pub debounce: Option<Duration>,
    /// Emit at most once per window, with the latest value
    pub buffer: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_initial(mut self) -> Self {
        self.skip_initial = true;
        self
    }

    pub fn include(mut self, selection: SelectionSet) -> Self {
        self.include = Some(selection);
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

pub(crate) struct ResourceFold {
    manager: SubscriptionManager,
    resource: String,
    id: String,
    include: Option<SelectionSet>,
    current: Option<Value>,
}

impl ResourceFold {
    /// Reloads the included relationships of the current value with a loader
    /// that has not cached anything yet
    async fn reload_relationships(&mut self) -> EngineResult<()> {
        let (Some(include), Some(current)) = (&self.include, self.current.as_mut()) else {
            return Ok(());
        };
        let loader = self.manager.fresh_loader();
        resolve_into(&loader, &self.resource, std::slice::from_mut(current), include).await
    }
}

#[async_trait]
impl Fold for ResourceFold {
    type Output = Value;

    fn is_relevant(&self, event: &ResourceEvent) -> bool {
        event.resource == self.resource && event.entity_id().as_deref() == Some(self.id.as_str())
    }

    async fn apply(&mut self, event: ResourceEvent) -> EngineResult<bool> {
        match event.kind {
            EventKind::Updated { changes, entity, .. } => {
                match self.current.as_mut() {
                    Some(current) => merge_into(current, &changes),
                    None => {
                        let fresh = self.manager.fresh_loader().load(&self.resource, &self.id).await?;
                        self.current = Some(fresh.unwrap_or(entity));
                    }
                }
                self.reload_relationships().await?;
                Ok(true)
            }
            EventKind::Deleted { .. } => {
                self.current = None;
                Ok(true)
            }
            EventKind::Created { entity } => {
                self.current = Some(entity);
                self.reload_relationships().await?;
                Ok(true)
            }
            EventKind::RelationshipAdded { .. } | EventKind::RelationshipRemoved { .. } => {
                if self.include.is_none() || self.current.is_none() {
                    return Ok(false);
                }
                self.reload_relationships().await?;
                Ok(true)
            }
        }
    }

    fn snapshot(&self) -> Value {
        self.current.clone().unwrap_or(Value::Null)
    }

    fn state_of(&self, output: &Value) -> SubscriptionState {
        if output.is_null() {
            SubscriptionState::Deleted
        } else {
            SubscriptionState::Live
        }
    }
}

impl SubscriptionManager {
    /// Subscribes to one entity.
    ///
    /// Listeners are attached before the initial fetch so no change made in
    /// between is missed. The initial value goes through `loader`; `null`
    /// means the entity does not exist (yet).
    pub async fn subscribe(
        &self,
        loader: &BatchLoader,
        resource: &str,
        id: &str,
        options: SubscribeOptions,
    ) -> EngineResult<Subscription<Value>> {
        self.registry().require(resource)?;

        let streams = vec![
            self.bus().subscribe(&channels::entity(resource, id)).await?,
            self.bus().subscribe(&channels::global(resource)).await?,
        ];

        let current = if options.skip_initial {
            None
        } else {
            let mut entity = loader.load(resource, id).await?;
            if let (Some(include), Some(value)) = (&options.include, entity.as_mut()) {
                resolve_into(loader, resource, std::slice::from_mut(value), include).await?;
            }
            entity
        };

        let fold = ResourceFold {
            manager: self.clone(),
            resource: resource.to_string(),
            id: id.to_string(),
            include: options.include,
            current,
        };
        let initial = (!options.skip_initial).then(|| fold.snapshot());
        let gate = Gate::from_options(options.debounce, options.buffer);

        tracing::debug!(resource, id, "resource subscription");
        Ok(self.start(fold, streams, initial, gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::events::{EventBus, EventStream, MemoryEventBus};
    use crate::loading::optimizer::test_support::{blog_registry, blog_storage};
    use crate::loading::LoaderConfig;
    use crate::mutations::{MutationHandler, MutationOptions};
    use crate::resource::{ResourceDefinition, ResourceRegistry};
    use crate::storage::MemoryStorage;
    use futures::StreamExt;
    use resource_schema::{FieldSpec, Schema};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(500);

    struct Fixture {
        manager: SubscriptionManager,
        mutations: MutationHandler,
        loader: BatchLoader,
        bus: Arc<MemoryEventBus>,
    }

    fn fixture(registry: ResourceRegistry, storage: MemoryStorage) -> Fixture {
        let storage = Arc::new(storage);
        let bus = Arc::new(MemoryEventBus::new());
        let config = EngineConfig::default();
        Fixture {
            manager: SubscriptionManager::new(registry.clone(), storage.clone(), bus.clone(), &config),
            mutations: MutationHandler::new(registry.clone(), storage.clone(), bus.clone()),
            loader: BatchLoader::new(registry, storage, LoaderConfig::from(&config)),
            bus,
        }
    }

    fn message_fixture() -> Fixture {
        let registry = ResourceRegistry::new();
        registry
            .register(
                ResourceDefinition::new("message").schema(
                    Schema::new()
                        .field("id", FieldSpec::string().optional())
                        .field("role", FieldSpec::string())
                        .field("content", FieldSpec::string()),
                ),
            )
            .unwrap();
        let storage = MemoryStorage::new();
        storage.seed(
            "message",
            vec![json!({"id": "msg-1", "role": "user", "content": "Original"})],
        );
        fixture(registry, storage)
    }

    async fn next_value(subscription: &mut Subscription<Value>) -> Value {
        timeout(WAIT, subscription.next())
            .await
            .expect("no emission in time")
            .expect("subscription ended")
            .expect("subscription failed")
    }

    #[tokio::test]
    async fn test_follows_entity_through_update_and_delete() {
        let f = message_fixture();
        let mut sub = f
            .manager
            .subscribe(&f.loader, "message", "msg-1", SubscribeOptions::new())
            .await
            .unwrap();

        assert_eq!(next_value(&mut sub).await["content"], "Original");
        assert_eq!(sub.state(), SubscriptionState::Live);

        let changes = json!({"content": "Updated"});
        f.mutations
            .update(&f.loader, "message", "msg-1", changes, MutationOptions::default())
            .await
            .unwrap();
        let updated = next_value(&mut sub).await;
        assert_eq!(updated["content"], "Updated");
        assert_eq!(updated["role"], "user");

        f.mutations
            .delete(&f.loader, "message", "msg-1", MutationOptions::default())
            .await
            .unwrap();
        assert_eq!(next_value(&mut sub).await, Value::Null);
        assert_eq!(sub.state(), SubscriptionState::Deleted);

        // no duplicate emission from the second channel
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_missing_entity_comes_alive_on_create() {
        let f = message_fixture();
        let mut sub = f
            .manager
            .subscribe(&f.loader, "message", "msg-9", SubscribeOptions::new())
            .await
            .unwrap();
        assert_eq!(next_value(&mut sub).await, Value::Null);
        assert_eq!(sub.state(), SubscriptionState::Deleted);

        let input = json!({"id": "msg-9", "role": "user", "content": "hello"});
        f.mutations
            .create(&f.loader, "message", input, MutationOptions::default())
            .await
            .unwrap();
        assert_eq!(next_value(&mut sub).await["content"], "hello");
        assert_eq!(sub.state(), SubscriptionState::Live);
    }

    #[tokio::test]
    async fn test_state_is_settled_when_subscribe_returns() {
        let f = message_fixture();
        let existing = f
            .manager
            .subscribe(&f.loader, "message", "msg-1", SubscribeOptions::new())
            .await
            .unwrap();
        assert_eq!(existing.state(), SubscriptionState::Live);

        let missing = f
            .manager
            .subscribe(&f.loader, "message", "msg-404", SubscribeOptions::new())
            .await
            .unwrap();
        assert_eq!(missing.state(), SubscriptionState::Deleted);

        let skipped = f
            .manager
            .subscribe(&f.loader, "message", "msg-404", SubscribeOptions::new().skip_initial())
            .await
            .unwrap();
        assert_eq!(skipped.state(), SubscriptionState::Live);
    }

    #[tokio::test]
    async fn test_ignores_other_entities() {
        let f = message_fixture();
        let mut sub = f
            .manager
            .subscribe(&f.loader, "message", "msg-1", SubscribeOptions::new().skip_initial())
            .await
            .unwrap();

        let input = json!({"id": "msg-2", "role": "user", "content": "other"});
        f.mutations
            .create(&f.loader, "message", input, MutationOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_emission_and_detaches() {
        let f = message_fixture();
        let mut sub = f
            .manager
            .subscribe(&f.loader, "message", "msg-1", SubscribeOptions::new())
            .await
            .unwrap();
        next_value(&mut sub).await;
        assert_eq!(f.bus.subscriber_count("message:msg-1").await, 1);
        assert_eq!(f.manager.active_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert!(!sub.is_active());

        let changes = json!({"content": "late"});
        f.mutations
            .update(&f.loader, "message", "msg-1", changes, MutationOptions::default())
            .await
            .unwrap();
        assert!(sub.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.bus.subscriber_count("message:msg-1").await, 0);
        assert_eq!(f.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_debounce_emits_latest_once() {
        let f = message_fixture();
        let options = SubscribeOptions::new()
            .skip_initial()
            .debounce(Duration::from_millis(60));
        let mut sub = f.manager.subscribe(&f.loader, "message", "msg-1", options).await.unwrap();

        for content in ["one", "two", "three"] {
            let changes = json!({"content": content});
            f.mutations
                .update(&f.loader, "message", "msg-1", changes, MutationOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(next_value(&mut sub).await["content"], "three");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_buffer_keeps_latest_in_window() {
        let f = message_fixture();
        let options = SubscribeOptions::new()
            .skip_initial()
            .buffer(Duration::from_millis(60));
        let mut sub = f.manager.subscribe(&f.loader, "message", "msg-1", options).await.unwrap();

        for content in ["a", "b"] {
            let changes = json!({"content": content});
            f.mutations
                .update(&f.loader, "message", "msg-1", changes, MutationOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(next_value(&mut sub).await["content"], "b");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_include_reloads_relationships() {
        let f = fixture(blog_registry(), blog_storage());
        let include = SelectionSet::new().relation("tags", SelectionSet::new().field("label"));
        let mut sub = f
            .manager
            .subscribe(&f.loader, "post", "p2", SubscribeOptions::new().include(include))
            .await
            .unwrap();

        let initial = next_value(&mut sub).await;
        assert_eq!(initial["tags"], json!([]));

        f.mutations
            .link(&f.loader, "post", "p2", "tags", "t1")
            .await
            .unwrap();
        let linked = next_value(&mut sub).await;
        assert_eq!(linked["tags"], json!([{"label": "intro"}]));
        assert_eq!(linked["title"], "Async");
    }

    #[tokio::test]
    async fn test_unknown_resource_is_rejected() {
        let f = message_fixture();
        let err = f
            .manager
            .subscribe(&f.loader, "ghost", "1", SubscribeOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownResource(_)));
    }

    struct BrokenBus;

    #[async_trait]
    impl EventBus for BrokenBus {
        async fn publish(&self, _channel: &str, _event: ResourceEvent) -> EngineResult<usize> {
            Ok(0)
        }

        async fn subscribe(&self, channel: &str) -> EngineResult<EventStream> {
            let failure: EngineResult<ResourceEvent> = Err(EngineError::Event("connection lost".to_string()));
            let inner = futures::stream::iter(vec![failure])
                .chain(futures::stream::pending())
                .boxed();
            Ok(EventStream::new(channel, inner))
        }
    }

    #[tokio::test]
    async fn test_channel_error_fails_subscription() {
        let registry = blog_registry();
        let storage: Arc<MemoryStorage> = Arc::new(blog_storage());
        let config = EngineConfig::default();
        let manager = SubscriptionManager::new(registry.clone(), storage.clone(), Arc::new(BrokenBus), &config);
        let loader = BatchLoader::new(registry, storage, LoaderConfig::from(&config));

        let mut sub = manager
            .subscribe(&loader, "post", "p1", SubscribeOptions::new())
            .await
            .unwrap();
        assert_eq!(next_value(&mut sub).await["title"], "Borrowing");

        let err = timeout(WAIT, sub.next()).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Event(_)));
        assert!(matches!(sub.state(), SubscriptionState::Failed(_)));
        assert!(timeout(WAIT, sub.next()).await.unwrap().is_none());
    }
}
