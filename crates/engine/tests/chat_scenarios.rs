//! End-to-end scenarios through the engine facade: a chat model with
//! conversations and messages, hooks, reads and live subscriptions.

use std::sync::Arc;
use std::time::Duration;

use resource_engine::{
    Engine, EngineConfigBuilder, EngineError, Hook, HookEvent, ListSubscribeOptions, MemoryStorage, OrderBy,
    QueryOptions, Relationship, ResourceDefinition, SelectionSet, Strategy, SubscribeOptions, Subscription,
    SubscriptionState,
};
use resource_schema::{FieldSpec, Schema};
use serde_json::{json, Value};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_millis(500);

fn conversation() -> ResourceDefinition {
    ResourceDefinition::new("conversation")
        .schema(
            Schema::new()
                .field("id", FieldSpec::string().optional())
                .field("title", FieldSpec::string()),
        )
        .relationship(
            "messages",
            Relationship::has_many("message", "conversationId").ordered_by(OrderBy::asc("id")),
        )
}

fn message() -> ResourceDefinition {
    ResourceDefinition::new("message")
        .table("messages")
        .schema(
            Schema::new()
                .field("id", FieldSpec::string().optional())
                .field("conversationId", FieldSpec::string())
                .field("role", FieldSpec::string())
                .field("content", FieldSpec::string()),
        )
        .relationship("conversation", Relationship::belongs_to("conversation", "conversationId"))
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
}

fn setup() -> (Engine, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed("conversation", vec![json!({"id": "c1", "title": "Launch"})]);
    storage.seed(
        "messages",
        vec![
            json!({"id": "msg-1", "conversationId": "c1", "role": "user", "content": "Original"}),
            json!({"id": "msg-2", "conversationId": "c1", "role": "assistant", "content": "Reply"}),
        ],
    );

    let config = EngineConfigBuilder::testing()
        .build()
        .expect("Failed to build config");
    let engine = Engine::builder(config)
        .storage(storage.clone())
        .resources([conversation(), message()])
        .build()
        .expect("Failed to build engine");
    (engine, storage)
}

async fn next_item<T>(subscription: &mut Subscription<T>) -> T {
    timeout(WAIT, subscription.next())
        .await
        .expect("no emission in time")
        .expect("subscription ended")
        .expect("subscription failed")
}

#[tokio::test]
async fn test_before_create_hook_shapes_stored_and_published_entity() {
    let (engine, storage) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    let mut list = messages
        .subscribe_list(ListSubscribeOptions::new().skip_initial())
        .await
        .unwrap();

    let created = messages
        .create(
            &request,
            json!({"id": "msg-3", "conversationId": "c1", "role": "user", "content": "hi"}),
        )
        .await
        .unwrap();
    assert_eq!(created["role"], "assistant");

    let stored = storage
        .rows("messages")
        .into_iter()
        .find(|row| row["id"] == "msg-3")
        .unwrap();
    assert_eq!(stored["role"], "assistant");

    let published = next_item(&mut list).await;
    assert_eq!(published[0]["role"], "assistant");
}

#[tokio::test]
async fn test_entity_subscription_sees_update_then_delete() {
    let (engine, storage) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    request.loader().prime(
        "message",
        "msg-1",
        json!({"id": "msg-1", "conversationId": "c1", "role": "user", "content": "Original"}),
    );
    storage.reset_stats();

    let mut sub = messages
        .subscribe(&request, "msg-1", SubscribeOptions::new())
        .await
        .unwrap();
    assert_eq!(next_item(&mut sub).await["content"], "Original");
    assert_eq!(storage.stats().reads(), 0);

    messages
        .update(&request, "msg-1", json!({"content": "Updated"}))
        .await
        .unwrap();
    assert_eq!(next_item(&mut sub).await["content"], "Updated");

    messages.delete(&request, "msg-1").await.unwrap();
    assert_eq!(next_item(&mut sub).await, Value::Null);
    assert_eq!(sub.state(), SubscriptionState::Deleted);
}

#[tokio::test]
async fn test_list_subscription_starts_empty() {
    let (engine, _) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    let mut list = messages.subscribe_list(ListSubscribeOptions::new()).await.unwrap();
    // existing messages are not part of the starting list
    assert!(next_item(&mut list).await.is_empty());

    messages
        .create(
            &request,
            json!({"id": "msg-9", "conversationId": "c1", "role": "user", "content": "new"}),
        )
        .await
        .unwrap();
    let current = next_item(&mut list).await;
    assert_eq!(current.len(), 1);
    assert_eq!(current[0]["id"], "msg-9");

    messages.delete(&request, "msg-9").await.unwrap();
    assert!(next_item(&mut list).await.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_later_events() {
    let (engine, _) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    let mut sub = messages
        .subscribe(&request, "msg-1", SubscribeOptions::new())
        .await
        .unwrap();
    next_item(&mut sub).await;
    sub.unsubscribe();

    messages
        .update(&request, "msg-1", json!({"content": "ignored"}))
        .await
        .unwrap();
    messages.delete(&request, "msg-1").await.unwrap();

    assert!(sub.next().await.is_none());
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
}

#[tokio::test]
async fn test_get_nests_relationships() {
    let (engine, _) = setup();
    let conversations = engine.handlers("conversation").unwrap();
    let request = engine.request();

    let selection = SelectionSet::new()
        .field("title")
        .relation("messages", SelectionSet::new().fields(["id", "content"]));
    assert_eq!(conversations.plan(&selection).unwrap().strategy, Strategy::Batch);

    let data = conversations.get(&request, "c1", &selection).await.unwrap();
    assert_eq!(
        data,
        json!({
            "title": "Launch",
            "messages": [
                {"id": "msg-1", "content": "Original"},
                {"id": "msg-2", "content": "Reply"}
            ]
        })
    );

    let missing = conversations.get(&request, "c404", &selection).await.unwrap();
    assert_eq!(missing, Value::Null);
}

#[tokio::test]
async fn test_lazy_plan_fills_deferred_relationships() {
    let (engine, _) = setup();
    let conversations = engine.handlers("conversation").unwrap();
    let request = engine.request();

    let selection = SelectionSet::new().field("title").relation(
        "messages",
        SelectionSet::new().field("content").relation(
            "conversation",
            SelectionSet::new()
                .field("title")
                .relation("messages", SelectionSet::new().field("id")),
        ),
    );
    let plan = conversations.plan(&selection).unwrap();
    assert_eq!(plan.strategy, Strategy::Lazy);
    assert_eq!(plan.steps.len(), 1);

    let data = conversations.get(&request, "c1", &selection).await.unwrap();
    assert_eq!(data["title"], "Launch");
    assert!(data.get("id").is_none());

    let first = &data["messages"][0];
    assert_eq!(first["content"], "Original");
    assert_eq!(first["conversation"]["title"], "Launch");
    assert_eq!(
        first["conversation"]["messages"],
        json!([{"id": "msg-1"}, {"id": "msg-2"}])
    );
}

#[tokio::test]
async fn test_list_applies_options() {
    let (engine, _) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    let options = QueryOptions::new().filter("role", json!("assistant"));
    let data = messages
        .list(&request, options, &SelectionSet::new().field("content"))
        .await
        .unwrap();
    assert_eq!(data, json!([{"content": "Reply"}]));
}

#[tokio::test]
async fn test_validation_rejects_bad_input() {
    let (engine, _) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    let err = messages
        .create(&request, json!({"conversationId": "c1", "role": "user", "content": 7}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));

    let err = messages
        .update(&request, "msg-1", json!({"unknown": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
}

#[tokio::test]
async fn test_shutdown_ends_subscriptions() {
    let (engine, _) = setup();
    let messages = engine.handlers("message").unwrap();
    let request = engine.request();

    let mut sub = messages
        .subscribe(&request, "msg-2", SubscribeOptions::new().skip_initial())
        .await
        .unwrap();
    engine.shutdown();
    assert!(timeout(WAIT, sub.next()).await.unwrap().is_none());
}
