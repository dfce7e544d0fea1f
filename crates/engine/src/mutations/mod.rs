//! Write path: create, update, delete and relationship links
//!
//! Every mutation follows the same order: before-hook, validation,
//! persistence, cache maintenance, after-hook, publish. The cache is
//! updated before the event goes out so a subscriber that re-reads on
//! receipt never sees the old row.

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, ResourceEvent};
use crate::loading::BatchLoader;
use crate::resource::{Relationship, Resource, ResourceRegistry};
use crate::storage::StorageBackend;
use crate::value::{key_of, merge_into};
use resource_schema::{ValidationError, ValidationErrors};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Bypass lifecycle hooks; persistence, caching and events still happen
    pub skip_hooks: bool,
}

impl MutationOptions {
    pub fn skip_hooks() -> Self {
        Self { skip_hooks: true }
    }
}

/// Applies mutations for any registered resource
#[derive(Clone)]
pub struct MutationHandler {
    registry: ResourceRegistry,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<dyn EventBus>,
}

impl MutationHandler {
    pub fn new(registry: ResourceRegistry, storage: Arc<dyn StorageBackend>, bus: Arc<dyn EventBus>) -> Self {
        Self { registry, storage, bus }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub async fn create(
        &self,
        loader: &BatchLoader,
        resource: &str,
        input: Value,
        options: MutationOptions,
    ) -> EngineResult<Value> {
        let definition = self.registry.require(resource)?;
        let mut data = into_object(resource, input)?;
        if !options.skip_hooks {
            data = definition.hooks().before_create(data).await?;
        }

        let mut parsed = definition
            .schema()
            .parse(&Value::Object(data))
            .map_err(|errors| EngineError::validation(resource, errors))?;
        let id = match parsed.get("id").and_then(key_of) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                parsed.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let entity = self.storage.insert(definition.table(), Value::Object(parsed)).await?;
        loader.prime(resource, &id, entity.clone());

        if !options.skip_hooks {
            definition.hooks().after_create(&entity).await?;
        }
        self.publish(ResourceEvent::created(resource, entity.clone())).await?;

        tracing::info!(resource, id = %id, "entity created");
        Ok(entity)
    }

    /// Validates `data` against the partial schema and merges it over the
    /// stored entity. Only the validated changes are published.
    pub async fn update(
        &self,
        loader: &BatchLoader,
        resource: &str,
        id: &str,
        data: Value,
        options: MutationOptions,
    ) -> EngineResult<Value> {
        let definition = self.registry.require(resource)?;
        let mut data = into_object(resource, data)?;
        if !options.skip_hooks {
            data = definition.hooks().before_update(id, data).await?;
        }

        let changes = definition
            .schema()
            .parse_partial(&Value::Object(data))
            .map_err(|errors| EngineError::validation(resource, errors))?;
        if let Some(new_id) = changes.get("id").and_then(key_of) {
            if new_id != id {
                return Err(field_error(resource, "id", "id cannot be changed"));
            }
        }

        let mut entity = self
            .storage
            .find_by_id(definition.table(), id)
            .await?
            .ok_or_else(|| EngineError::not_found(resource, id))?;
        merge_into(&mut entity, &changes);
        let entity = self.storage.update(definition.table(), id, entity).await?;

        // a primed value is never merged into; replace it outright
        loader.clear(resource, Some(id));
        loader.prime(resource, id, entity.clone());

        if !options.skip_hooks {
            definition.hooks().after_update(&entity).await?;
        }
        self.publish(ResourceEvent::updated(resource, id, changes, entity.clone()))
            .await?;

        tracing::info!(resource, id, "entity updated");
        Ok(entity)
    }

    /// Removes the entity and returns it as it was before deletion
    pub async fn delete(
        &self,
        loader: &BatchLoader,
        resource: &str,
        id: &str,
        options: MutationOptions,
    ) -> EngineResult<Value> {
        let definition = self.registry.require(resource)?;
        if !options.skip_hooks {
            definition.hooks().before_delete(id).await?;
        }

        let entity = self
            .storage
            .find_by_id(definition.table(), id)
            .await?
            .ok_or_else(|| EngineError::not_found(resource, id))?;
        if !self.storage.delete(definition.table(), id).await? {
            return Err(EngineError::not_found(resource, id));
        }
        loader.clear(resource, Some(id));

        if !options.skip_hooks {
            definition.hooks().after_delete(id).await?;
        }
        self.publish(ResourceEvent::deleted(resource, id)).await?;

        tracing::info!(resource, id, "entity deleted");
        Ok(entity)
    }

    /// Associates `child_id` with `parent_id` through `relationship`.
    ///
    /// Join-table relationships get a join row; `hasMany`/`hasOne` set the
    /// child's foreign key; `belongsTo` sets the parent's.
    pub async fn link(
        &self,
        loader: &BatchLoader,
        resource: &str,
        parent_id: &str,
        relationship: &str,
        child_id: &str,
    ) -> EngineResult<()> {
        let definition = self.registry.require(resource)?;
        let declared = self.registry.relationship(resource, relationship)?;

        match join_table(&declared) {
            Some((table, foreign_key, target_foreign_key)) => {
                let mut row = Map::new();
                row.insert("id".to_string(), Value::String(join_row_id(parent_id, child_id)));
                row.insert(foreign_key.to_string(), Value::String(parent_id.to_string()));
                row.insert(target_foreign_key.to_string(), Value::String(child_id.to_string()));
                self.storage
                    .insert(&self.registry.table_name(table), Value::Object(row))
                    .await?;
                loader.clear(table, None);
            }
            None => {
                let (owner, owner_id, value) = foreign_key_owner(&definition, &declared, parent_id, child_id);
                self.set_field(loader, owner, owner_id, declared.foreign_key(), Value::String(value.to_string()))
                    .await?;
            }
        }

        self.publish(ResourceEvent::relationship_added(resource, parent_id, relationship, child_id))
            .await?;
        tracing::info!(resource, parent_id, relationship, child_id, "relationship linked");
        Ok(())
    }

    /// Reverses [`link`](MutationHandler::link). Fails with `NotFound` when
    /// the two entities are not linked.
    pub async fn unlink(
        &self,
        loader: &BatchLoader,
        resource: &str,
        parent_id: &str,
        relationship: &str,
        child_id: &str,
    ) -> EngineResult<()> {
        let definition = self.registry.require(resource)?;
        let declared = self.registry.relationship(resource, relationship)?;

        match join_table(&declared) {
            Some((table, foreign_key, target_foreign_key)) => {
                let storage_table = self.registry.table_name(table);
                let rows = self
                    .storage
                    .find_by_field(&storage_table, foreign_key, &[parent_id.to_string()])
                    .await?;
                let mut removed = 0;
                for row in rows
                    .iter()
                    .filter(|row| row.get(target_foreign_key).and_then(key_of).as_deref() == Some(child_id))
                {
                    let Some(id) = row.get("id").and_then(key_of) else {
                        tracing::warn!(table, "join row without an id cannot be removed");
                        continue;
                    };
                    if self.storage.delete(&storage_table, &id).await? {
                        removed += 1;
                    }
                }
                if removed == 0 {
                    return Err(EngineError::not_found(table, &join_row_id(parent_id, child_id)));
                }
                loader.clear(table, None);
            }
            None => {
                let (owner, owner_id, linked) = foreign_key_owner(&definition, &declared, parent_id, child_id);
                let table = self.registry.table_name(owner);
                let current = self
                    .storage
                    .find_by_id(&table, owner_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found(owner, owner_id))?;
                if current.get(declared.foreign_key()).and_then(key_of).as_deref() != Some(linked) {
                    return Err(EngineError::not_found(owner, owner_id));
                }
                self.set_field(loader, owner, owner_id, declared.foreign_key(), Value::Null)
                    .await?;
            }
        }

        self.publish(ResourceEvent::relationship_removed(resource, parent_id, relationship, child_id))
            .await?;
        tracing::info!(resource, parent_id, relationship, child_id, "relationship unlinked");
        Ok(())
    }

    async fn set_field(
        &self,
        loader: &BatchLoader,
        resource: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> EngineResult<Value> {
        let table = self.registry.table_name(resource);
        let mut entity = self
            .storage
            .find_by_id(&table, id)
            .await?
            .ok_or_else(|| EngineError::not_found(resource, id))?;
        let mut changes = Map::new();
        changes.insert(field.to_string(), value);
        merge_into(&mut entity, &changes);

        let entity = self.storage.update(&table, id, entity).await?;
        loader.clear(resource, Some(id));
        loader.prime(resource, id, entity.clone());
        Ok(entity)
    }

    async fn publish(&self, event: ResourceEvent) -> EngineResult<()> {
        for channel in event.channels() {
            let delivered = self.bus.publish(&channel, event.clone()).await?;
            tracing::debug!(channel = %channel, event = event.event_type(), delivered, "event published");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MutationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationHandler")
            .field("resources", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn into_object(resource: &str, input: Value) -> EngineResult<Map<String, Value>> {
    match input {
        Value::Object(object) => Ok(object),
        _ => Err(field_error(resource, "$", "expected an object")),
    }
}

fn field_error(resource: &str, field: &str, message: &str) -> EngineError {
    let mut errors = ValidationErrors::new();
    errors.add(ValidationError::new(field, message));
    EngineError::validation(resource, errors)
}

fn join_row_id(parent_id: &str, child_id: &str) -> String {
    format!("{}:{}", parent_id, child_id)
}

/// `(table, parent key, target key)` for relationships stored as join rows
fn join_table(relationship: &Relationship) -> Option<(&str, &str, &str)> {
    match relationship {
        Relationship::ManyToMany {
            foreign_key,
            through,
            target_foreign_key,
            ..
        } => Some((through, foreign_key, target_foreign_key)),
        Relationship::HasMany {
            foreign_key,
            through: Some(through),
            ..
        } => Some((&through.table, foreign_key, &through.target_foreign_key)),
        _ => None,
    }
}

/// Which entity carries the foreign key, and the id it should point at
fn foreign_key_owner<'a>(
    parent: &'a Resource,
    relationship: &'a Relationship,
    parent_id: &'a str,
    child_id: &'a str,
) -> (&'a str, &'a str, &'a str) {
    match relationship {
        Relationship::BelongsTo { .. } => (parent.name(), parent_id, child_id),
        _ => (relationship.target(), child_id, parent_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, MemoryEventBus};
    use crate::loading::optimizer::test_support::{blog_registry, blog_storage};
    use crate::loading::LoaderConfig;
    use crate::resource::{Hook, HookEvent, ResourceDefinition};
    use crate::storage::MemoryStorage;
    use resource_schema::{FieldSpec, Schema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        handler: MutationHandler,
        loader: BatchLoader,
        storage: Arc<MemoryStorage>,
        bus: Arc<MemoryEventBus>,
    }

    fn fixture(registry: ResourceRegistry, storage: MemoryStorage) -> Fixture {
        let storage = Arc::new(storage);
        let bus = Arc::new(MemoryEventBus::new());
        let loader = BatchLoader::new(
            registry.clone(),
            storage.clone(),
            LoaderConfig {
                batch_window: Duration::from_millis(1),
                max_batch_size: 100,
            },
        );
        Fixture {
            handler: MutationHandler::new(registry, storage.clone(), bus.clone()),
            loader,
            storage,
            bus,
        }
    }

    fn message_registry(after_create_calls: Arc<AtomicUsize>) -> ResourceRegistry {
        let registry = ResourceRegistry::new();
        registry
            .register(
                ResourceDefinition::new("message")
                    .table("messages")
                    .schema(
                        Schema::new()
                            .field("id", FieldSpec::string().optional())
                            .field("role", FieldSpec::string())
                            .field("content", FieldSpec::string()),
                    )
                    .hook(
                        "beforeCreate",
                        Hook::sync(|event| match event {
                            HookEvent::BeforeCreate { data } => {
                                let mut data = data.clone();
                                data.insert("role".to_string(), json!("assistant"));
                                Ok(Some(data))
                            }
                            _ => Ok(None),
                        }),
                    )
                    .hook(
                        "afterCreate",
                        Hook::sync(move |_| {
                            after_create_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(None)
                        }),
                    )
                    .hook(
                        "beforeDelete",
                        Hook::sync(|event| match event {
                            HookEvent::BeforeDelete { id } if id == "pinned" => Err("pinned messages stay".into()),
                            _ => Ok(None),
                        }),
                    ),
            )
            .unwrap();
        registry
    }

    fn messages() -> Fixture {
        fixture(message_registry(Arc::new(AtomicUsize::new(0))), MemoryStorage::new())
    }

    #[tokio::test]
    async fn test_create_runs_hooks_and_publishes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let f = fixture(message_registry(calls.clone()), MemoryStorage::new());
        let mut global = f.bus.subscribe("message").await.unwrap();

        let entity = f
            .handler
            .create(
                &f.loader,
                "message",
                json!({"id": "msg-1", "role": "user", "content": "hi"}),
                MutationOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(entity["role"], "assistant");
        assert_eq!(f.storage.rows("messages")[0]["role"], "assistant");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let event = global.recv().await.unwrap().unwrap();
        match event.kind {
            EventKind::Created { entity } => assert_eq!(entity["role"], "assistant"),
            other => panic!("unexpected event {:?}", other),
        }

        // primed: no read reaches storage
        let cached = f.loader.load("message", "msg-1").await.unwrap().unwrap();
        assert_eq!(cached["content"], "hi");
        assert_eq!(f.storage.stats().reads(), 0);
    }

    #[tokio::test]
    async fn test_create_assigns_uuid() {
        let f = messages();
        let entity = f
            .handler
            .create(
                &f.loader,
                "message",
                json!({"role": "user", "content": "hi"}),
                MutationOptions::default(),
            )
            .await
            .unwrap();

        let id = entity["id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_skip_hooks_still_persists_and_publishes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let f = fixture(message_registry(calls.clone()), MemoryStorage::new());
        let mut global = f.bus.subscribe("message").await.unwrap();

        let entity = f
            .handler
            .create(
                &f.loader,
                "message",
                json!({"id": "m1", "role": "user", "content": "hi"}),
                MutationOptions::skip_hooks(),
            )
            .await
            .unwrap();

        assert_eq!(entity["role"], "user");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.storage.rows("messages").len(), 1);
        assert!(global.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_without_side_effects() {
        let f = messages();
        let err = f
            .handler
            .create(&f.loader, "message", json!({"role": "user"}), MutationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let err = f
            .handler
            .create(
                &f.loader,
                "message",
                json!({"role": "user", "content": 7}),
                MutationOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(f.storage.rows("messages").is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_and_publishes_changes() {
        let f = messages();
        f.storage.seed(
            "messages",
            vec![json!({"id": "msg-1", "role": "user", "content": "Original"})],
        );
        // stale value in the request cache
        assert_eq!(
            f.loader.load("message", "msg-1").await.unwrap().unwrap()["content"],
            "Original"
        );

        let mut per_id = f.bus.subscribe("message:msg-1").await.unwrap();
        let mut global = f.bus.subscribe("message").await.unwrap();

        let entity = f
            .handler
            .update(
                &f.loader,
                "message",
                "msg-1",
                json!({"content": "Updated"}),
                MutationOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(entity, json!({"id": "msg-1", "role": "user", "content": "Updated"}));

        for stream in [&mut per_id, &mut global] {
            let event = stream.recv().await.unwrap().unwrap();
            match event.kind {
                EventKind::Updated { id, changes, entity } => {
                    assert_eq!(id, "msg-1");
                    assert_eq!(Value::Object(changes), json!({"content": "Updated"}));
                    assert_eq!(entity["role"], "user");
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        let cached = f.loader.load("message", "msg-1").await.unwrap().unwrap();
        assert_eq!(cached["content"], "Updated");
    }

    #[tokio::test]
    async fn test_update_errors() {
        let f = messages();
        f.storage
            .seed("messages", vec![json!({"id": "m1", "role": "user", "content": "x"})]);

        let missing = f
            .handler
            .update(&f.loader, "message", "nope", json!({"content": "y"}), MutationOptions::default())
            .await;
        assert!(missing.unwrap_err().is_not_found());

        let renamed = f
            .handler
            .update(&f.loader, "message", "m1", json!({"id": "m2"}), MutationOptions::default())
            .await;
        assert!(matches!(renamed, Err(EngineError::Validation { .. })));

        let unknown = f
            .handler
            .update(&f.loader, "message", "m1", json!({"colour": "red"}), MutationOptions::default())
            .await;
        assert!(matches!(unknown, Err(EngineError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_delete_clears_cache_and_publishes() {
        let f = messages();
        f.storage
            .seed("messages", vec![json!({"id": "m1", "role": "user", "content": "x"})]);
        f.loader.load("message", "m1").await.unwrap();

        let mut per_id = f.bus.subscribe("message:m1").await.unwrap();
        let mut global = f.bus.subscribe("message").await.unwrap();

        let removed = f
            .handler
            .delete(&f.loader, "message", "m1", MutationOptions::default())
            .await
            .unwrap();
        assert_eq!(removed["content"], "x");

        for stream in [&mut per_id, &mut global] {
            let event = stream.recv().await.unwrap().unwrap();
            assert_eq!(event.kind, EventKind::Deleted { id: "m1".to_string() });
        }
        assert!(f.loader.load("message", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_before_hook_failure_aborts_delete() {
        let f = messages();
        f.storage
            .seed("messages", vec![json!({"id": "pinned", "role": "user", "content": "x"})]);

        let err = f
            .handler
            .delete(&f.loader, "message", "pinned", MutationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook { ref hook, .. } if hook == "beforeDelete"));
        assert_eq!(f.storage.rows("messages").len(), 1);

        f.handler
            .delete(&f.loader, "message", "pinned", MutationOptions::skip_hooks())
            .await
            .unwrap();
        assert!(f.storage.rows("messages").is_empty());
    }

    #[tokio::test]
    async fn test_link_and_unlink_join_rows() {
        let f = fixture(blog_registry(), blog_storage());
        let mut per_id = f.bus.subscribe("post:p2").await.unwrap();

        f.handler.link(&f.loader, "post", "p2", "tags", "t1").await.unwrap();
        let tags = f.loader.load_by_field("post_tags", "postId", &["p2".to_string()]).await.unwrap();
        assert_eq!(tags["p2"].len(), 1);

        let event = per_id.recv().await.unwrap().unwrap();
        assert_eq!(event.event_type(), "relationship:added");

        f.handler.unlink(&f.loader, "post", "p2", "tags", "t1").await.unwrap();
        let tags = f.loader.load_by_field("post_tags", "postId", &["p2".to_string()]).await.unwrap();
        assert!(tags["p2"].is_empty());
        assert_eq!(per_id.recv().await.unwrap().unwrap().event_type(), "relationship:removed");

        let again = f.handler.unlink(&f.loader, "post", "p2", "tags", "t1").await;
        assert!(again.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_link_sets_foreign_keys() {
        let f = fixture(blog_registry(), blog_storage());

        // hasMany: the child's key moves
        f.handler.link(&f.loader, "user", "u3", "posts", "p3").await.unwrap();
        let post = f.loader.load("post", "p3").await.unwrap().unwrap();
        assert_eq!(post["authorId"], "u3");

        // belongsTo: the parent's own key moves
        f.handler.link(&f.loader, "post", "p1", "category", "k2").await.unwrap();
        assert_eq!(f.storage.rows("posts")[0]["categoryId"], "k2");

        f.handler.unlink(&f.loader, "post", "p1", "category", "k2").await.unwrap();
        assert_eq!(f.storage.rows("posts")[0]["categoryId"], Value::Null);

        let unrelated = f.handler.unlink(&f.loader, "user", "u1", "posts", "p3").await;
        assert!(unrelated.unwrap_err().is_not_found());
    }
}
