//! In-memory storage backend for development and testing

use super::StorageBackend;
use crate::error::{EngineError, EngineResult};
use crate::selection::QueryOptions;
use crate::value::{entity_id, key_of};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Call counters, mostly useful for asserting batching behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub find_by_id_calls: usize,
    pub find_many_calls: usize,
    pub find_by_field_calls: usize,
    pub query_calls: usize,
    pub writes: usize,
}

impl StorageStats {
    pub fn reads(&self) -> usize {
        self.find_by_id_calls + self.find_many_calls + self.find_by_field_calls + self.query_calls
    }
}

/// Tables of rows kept in insertion order
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: DashMap<String, Vec<Value>>,
    stats: Arc<RwLock<StorageStats>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-load rows without touching the write counters
    pub fn seed<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = Value>,
    {
        self.tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .get(table)
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StorageStats {
        self.stats.read().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.write() = StorageStats::default();
    }

    fn count(&self, update: impl FnOnce(&mut StorageStats)) {
        update(&mut self.stats.write());
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn find_by_id(&self, table: &str, id: &str) -> EngineResult<Option<Value>> {
        self.count(|s| s.find_by_id_calls += 1);
        Ok(self.tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| entity_id(row).as_deref() == Some(id))
                .cloned()
        }))
    }

    async fn find_many(&self, table: &str, ids: &[String]) -> EngineResult<Vec<Value>> {
        self.count(|s| s.find_many_calls += 1);
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| entity_id(row).is_some_and(|id| wanted.contains(id.as_str())))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_field(&self, table: &str, field: &str, values: &[String]) -> EngineResult<Vec<Value>> {
        self.count(|s| s.find_by_field_calls += 1);
        let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
        Ok(self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        row.get(field)
                            .and_then(key_of)
                            .is_some_and(|value| wanted.contains(value.as_str()))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query(&self, table: &str, options: &QueryOptions) -> EngineResult<Vec<Value>> {
        self.count(|s| s.query_calls += 1);
        Ok(options.apply(self.rows(table)))
    }

    async fn insert(&self, table: &str, entity: Value) -> EngineResult<Value> {
        let id = entity_id(&entity)
            .ok_or_else(|| EngineError::Storage(format!("row for '{}' has no id", table)))?;
        let mut rows = self.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|row| entity_id(row).as_deref() == Some(id.as_str())) {
            return Err(EngineError::Storage(format!(
                "duplicate id '{}' in '{}'",
                id, table
            )));
        }
        rows.push(entity.clone());
        drop(rows);
        self.count(|s| s.writes += 1);
        Ok(entity)
    }

    async fn update(&self, table: &str, id: &str, entity: Value) -> EngineResult<Value> {
        let mut rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| EngineError::not_found(table, id))?;
        let slot = rows
            .iter_mut()
            .find(|row| entity_id(row).as_deref() == Some(id))
            .ok_or_else(|| EngineError::not_found(table, id))?;
        *slot = entity.clone();
        drop(rows);
        self.count(|s| s.writes += 1);
        Ok(entity)
    }

    async fn delete(&self, table: &str, id: &str) -> EngineResult<bool> {
        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|row| entity_id(row).as_deref() != Some(id));
        let removed = rows.len() != before;
        drop(rows);
        if removed {
            self.count(|s| s.writes += 1);
        }
        Ok(removed)
    }
}
