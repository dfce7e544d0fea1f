//! Shared fixtures: a small blog model

use crate::error::BoxError;
use crate::resource::{ComputedField, Relationship, ResourceDefinition, ResourceRegistry};
use crate::selection::OrderBy;
use crate::storage::MemoryStorage;
use crate::value::entity_id;
use futures::FutureExt;
use resource_schema::{FieldSpec, Schema};
use serde_json::{json, Value};

pub(crate) fn blog_registry() -> ResourceRegistry {
    let registry = ResourceRegistry::new();

    registry
        .register(
            ResourceDefinition::new("user")
                .schema(
                    Schema::new()
                        .field("id", FieldSpec::string().optional())
                        .field("name", FieldSpec::string()),
                )
                .relationship(
                    "posts",
                    Relationship::has_many("post", "authorId").ordered_by(OrderBy::asc("title")),
                )
                .computed(
                    "postCount",
                    ComputedField::from_async(|user: Value, ctx| {
                        async move {
                            let id = entity_id(&user).unwrap_or_default();
                            let posts = ctx.loader.load_by_field("post", "authorId", &[id.clone()]).await?;
                            Ok::<Value, BoxError>(json!(posts.get(&id).map(Vec::len).unwrap_or(0)))
                        }
                        .boxed()
                    }),
                ),
        )
        .unwrap();

    registry
        .register(
            ResourceDefinition::new("post")
                .table("posts")
                .schema(
                    Schema::new()
                        .field("id", FieldSpec::string().optional())
                        .field("title", FieldSpec::string())
                        .field("authorId", FieldSpec::string())
                        .field("categoryId", FieldSpec::string().optional()),
                )
                .relationship("author", Relationship::belongs_to("user", "authorId"))
                .relationship("category", Relationship::belongs_to("category", "categoryId"))
                .relationship(
                    "comments",
                    Relationship::has_many("comment", "postId").ordered_by(OrderBy::asc("createdAt")),
                )
                .relationship("tags", Relationship::many_to_many("tag", "post_tags", "postId", "tagId"))
                .computed(
                    "titleLength",
                    ComputedField::sync(|post, _| {
                        let title = post.get("title").and_then(Value::as_str).unwrap_or_default();
                        Ok(json!(title.chars().count()))
                    }),
                ),
        )
        .unwrap();

    registry
        .register(
            ResourceDefinition::new("comment")
                .schema(
                    Schema::new()
                        .field("id", FieldSpec::string().optional())
                        .field("body", FieldSpec::string())
                        .field("postId", FieldSpec::string())
                        .field("authorId", FieldSpec::string())
                        .field("createdAt", FieldSpec::integer()),
                )
                .relationship("author", Relationship::belongs_to("user", "authorId"))
                .relationship("post", Relationship::belongs_to("post", "postId")),
        )
        .unwrap();

    for name in ["category", "tag"] {
        registry
            .register(
                ResourceDefinition::new(name).schema(
                    Schema::new()
                        .field("id", FieldSpec::string().optional())
                        .field("label", FieldSpec::string()),
                ),
            )
            .unwrap();
    }

    registry.validate_all_relationships().unwrap();
    registry
}

pub(crate) fn blog_storage() -> MemoryStorage {
    let storage = MemoryStorage::new();
    storage.seed(
        "user",
        vec![
            json!({"id": "u1", "name": "Ada"}),
            json!({"id": "u2", "name": "Grace"}),
            json!({"id": "u3", "name": "Linus"}),
        ],
    );
    storage.seed(
        "posts",
        vec![
            json!({"id": "p1", "title": "Borrowing", "authorId": "u1", "categoryId": "k1"}),
            json!({"id": "p2", "title": "Async", "authorId": "u1", "categoryId": "k2"}),
            json!({"id": "p3", "title": "Compilers", "authorId": "u2", "categoryId": "k1"}),
        ],
    );
    storage.seed(
        "comment",
        vec![
            json!({"id": "c1", "body": "nice", "postId": "p1", "authorId": "u2", "createdAt": 2}),
            json!({"id": "c2", "body": "first", "postId": "p1", "authorId": "u3", "createdAt": 1}),
            json!({"id": "c3", "body": "hmm", "postId": "p3", "authorId": "u1", "createdAt": 3}),
        ],
    );
    storage.seed(
        "category",
        vec![json!({"id": "k1", "label": "rust"}), json!({"id": "k2", "label": "tokio"})],
    );
    storage.seed(
        "tag",
        vec![json!({"id": "t1", "label": "intro"}), json!({"id": "t2", "label": "deep"})],
    );
    storage.seed(
        "post_tags",
        vec![
            json!({"postId": "p1", "tagId": "t1"}),
            json!({"postId": "p1", "tagId": "t2"}),
            json!({"postId": "p3", "tagId": "t2"}),
        ],
    );
    storage
}
