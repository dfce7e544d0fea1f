//! Storage backend abstraction
//!
//! The engine never talks to a database directly; every read and write goes
//! through a [`StorageBackend`]. Rows are JSON objects keyed by their `id`.

use crate::error::EngineResult;
use crate::selection::QueryOptions;
use async_trait::async_trait;
use serde_json::Value;

pub mod memory;

pub use memory::{MemoryStorage, StorageStats};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn find_by_id(&self, table: &str, id: &str) -> EngineResult<Option<Value>>;

    /// Rows whose id is in `ids`, in any order. Missing ids are omitted.
    async fn find_many(&self, table: &str, ids: &[String]) -> EngineResult<Vec<Value>>;

    /// Rows whose `field` equals one of `values`
    async fn find_by_field(&self, table: &str, field: &str, values: &[String]) -> EngineResult<Vec<Value>>;

    async fn query(&self, table: &str, options: &QueryOptions) -> EngineResult<Vec<Value>>;

    /// Insert a row that already carries its id; returns the stored row
    async fn insert(&self, table: &str, entity: Value) -> EngineResult<Value>;

    /// Replace the row with `id`; returns the stored row
    async fn update(&self, table: &str, id: &str, entity: Value) -> EngineResult<Value>;

    /// Returns false when no row had `id`
    async fn delete(&self, table: &str, id: &str) -> EngineResult<bool>;
}
