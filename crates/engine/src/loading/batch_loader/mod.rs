//! Request-scoped batching loader
//!
//! Point loads issued within `batch_window` of each other are coalesced into
//! a single `find_many` per resource; results are cached for the lifetime of
//! the loader, misses included. A loader belongs to one request and is never
//! shared across requests.
//!
//! Every `prime` and `clear` stamps the keys it touches. A fetch that was
//! issued before a key's latest stamp does not write that key back, so a
//! value primed while a batch is in flight is never replaced by older rows.

use crate::error::{EngineError, EngineResult};
use crate::resource::ResourceRegistry;
use crate::selection::{OrderBy, QueryOptions};
use crate::storage::StorageBackend;
use crate::value::{entity_id, key_of};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub mod config;


pub use config::{LoaderConfig, LoaderStats};

type CacheKey = (String, String);
type Waiter = oneshot::Sender<EngineResult<Option<Value>>>;

#[derive(Default)]
struct PendingBatch {
    ids: Vec<String>,
    waiters: HashMap<String, Vec<Waiter>>,
}

impl PendingBatch {
    fn enqueue(&mut self, id: &str, waiter: Waiter) {
        if !self.waiters.contains_key(id) {
            self.ids.push(id.to_string());
        }
        self.waiters.entry(id.to_string()).or_default().push(waiter);
    }
}

#[derive(Default)]
struct LoaderState {
    cache: HashMap<CacheKey, Option<Value>>,
    /// Ids waiting for the batch window to close, per resource
    pending: HashMap<String, PendingBatch>,
    /// Ids whose fetch has been issued but not answered
    in_flight: HashMap<CacheKey, Vec<Waiter>>,
    /// Bumped by every prime or clear
    clock: u64,
    stamps: HashMap<CacheKey, u64>,
    resource_stamps: HashMap<String, u64>,
    cleared_all: u64,
}

impl LoaderState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn stamp(&mut self, key: CacheKey) {
        let now = self.tick();
        self.stamps.insert(key, now);
    }

    /// Whether `key` was primed or cleared after a fetch issued at `issued`
    fn touched_since(&self, key: &CacheKey, issued: u64) -> bool {
        let latest = self
            .stamps
            .get(key)
            .copied()
            .max(self.resource_stamps.get(&key.0).copied())
            .unwrap_or(0)
            .max(self.cleared_all);
        latest > issued
    }

    /// Caches a fetched value unless the key changed since `issued`.
    /// Returns the value waiters should see.
    fn settle(&mut self, key: CacheKey, fetched: Option<Value>, issued: u64) -> Option<Value> {
        if !self.touched_since(&key, issued) {
            self.cache.insert(key, fetched.clone());
            return fetched;
        }
        match self.cache.get(&key) {
            Some(current) => current.clone(),
            None => fetched,
        }
    }
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicUsize,
    batches: AtomicUsize,
    keys: AtomicUsize,
    field_queries: AtomicUsize,
}

struct LoaderInner {
    registry: ResourceRegistry,
    storage: Arc<dyn StorageBackend>,
    config: LoaderConfig,
    state: Mutex<LoaderState>,
    counters: Counters,
}

/// Batching, caching loader for entities
#[derive(Clone)]
pub struct BatchLoader {
    inner: Arc<LoaderInner>,
}

impl BatchLoader {
    pub fn new(registry: ResourceRegistry, storage: Arc<dyn StorageBackend>, config: LoaderConfig) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                registry,
                storage,
                config,
                state: Mutex::new(LoaderState::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Load one entity by id. `Ok(None)` when it does not exist.
    pub async fn load(&self, resource: &str, id: &str) -> EngineResult<Option<Value>> {
        let key = (resource.to_string(), id.to_string());
        let receiver = {
            let mut state = self.inner.state.lock();
            if let Some(cached) = state.cache.get(&key) {
                self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.clone());
            }

            let (sender, receiver) = oneshot::channel();
            if let Some(waiters) = state.in_flight.get_mut(&key) {
                waiters.push(sender);
            } else {
                let schedule = !state.pending.contains_key(resource);
                state
                    .pending
                    .entry(resource.to_string())
                    .or_default()
                    .enqueue(id, sender);
                if schedule {
                    self.schedule_dispatch(resource.to_string());
                }
            }
            receiver
        };

        receiver.await.map_err(|_| {
            EngineError::Storage(format!("batch load of {} '{}' was dropped", resource, id))
        })?
    }

    /// Load several entities; the result is aligned with `ids`
    pub async fn load_many(&self, resource: &str, ids: &[String]) -> EngineResult<Vec<Option<Value>>> {
        futures::future::try_join_all(ids.iter().map(|id| self.load(resource, id))).await
    }

    /// Rows of `resource` whose `field` matches each parent id, in one
    /// storage call. Every requested parent id gets an entry, possibly empty.
    pub async fn load_by_field(
        &self,
        resource: &str,
        field: &str,
        parent_ids: &[String],
    ) -> EngineResult<HashMap<String, Vec<Value>>> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = parent_ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();

        let mut grouped: HashMap<String, Vec<Value>> =
            unique.iter().map(|id| (id.clone(), Vec::new())).collect();
        if unique.is_empty() {
            return Ok(grouped);
        }

        let table = self.inner.registry.table_name(resource);
        let issued = self.issue();
        let rows = self.inner.storage.find_by_field(&table, field, &unique).await?;
        self.inner.counters.field_queries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(resource, field, parents = unique.len(), rows = rows.len(), "loaded by field");

        self.store(resource, &rows, issued);
        for row in rows {
            if let Some(group) = row.get(field).and_then(key_of).and_then(|k| grouped.get_mut(&k)) {
                group.push(row);
            }
        }
        Ok(grouped)
    }

    /// [`load_by_field`](BatchLoader::load_by_field) with each group sorted
    pub async fn load_by_field_ordered(
        &self,
        resource: &str,
        field: &str,
        parent_ids: &[String],
        order_by: Option<&OrderBy>,
    ) -> EngineResult<HashMap<String, Vec<Value>>> {
        let mut grouped = self.load_by_field(resource, field, parent_ids).await?;
        if let Some(order) = order_by {
            for rows in grouped.values_mut() {
                order.sort(rows);
            }
        }
        Ok(grouped)
    }

    /// Run a list query and cache every returned row
    pub async fn query(&self, resource: &str, options: &QueryOptions) -> EngineResult<Vec<Value>> {
        let table = self.inner.registry.table_name(resource);
        let issued = self.issue();
        let rows = self.inner.storage.query(&table, options).await?;
        self.store(resource, &rows, issued);
        Ok(rows)
    }

    /// Seed the cache without fetching. An entry already holding a value is
    /// left untouched; call [`clear`](BatchLoader::clear) first to replace it.
    pub fn prime(&self, resource: &str, id: &str, value: Value) {
        let key = (resource.to_string(), id.to_string());
        let mut state = self.inner.state.lock();
        let slot = state.cache.entry(key.clone()).or_insert(None);
        if slot.is_none() {
            *slot = Some(value);
            state.stamp(key);
        }
    }

    /// Evict one id, or every entry of `resource` when `id` is `None`
    pub fn clear(&self, resource: &str, id: Option<&str>) {
        let mut state = self.inner.state.lock();
        match id {
            Some(id) => {
                let key = (resource.to_string(), id.to_string());
                state.cache.remove(&key);
                state.stamp(key);
            }
            None => {
                state.cache.retain(|(cached, _), _| cached != resource);
                let now = state.tick();
                state.resource_stamps.insert(resource.to_string(), now);
            }
        }
    }

    pub fn clear_all(&self) {
        let mut state = self.inner.state.lock();
        state.cache.clear();
        let now = state.tick();
        state.cleared_all = now;
    }

    pub fn stats(&self) -> LoaderStats {
        let cached_entries = self.inner.state.lock().cache.len();
        let counters = &self.inner.counters;
        LoaderStats {
            cached_entries,
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            batches_dispatched: counters.batches.load(Ordering::Relaxed),
            keys_fetched: counters.keys.load(Ordering::Relaxed),
            field_queries: counters.field_queries.load(Ordering::Relaxed),
        }
    }

    /// Logical time a storage call is issued at
    fn issue(&self) -> u64 {
        self.inner.state.lock().clock
    }

    fn store(&self, resource: &str, rows: &[Value], issued: u64) {
        let mut state = self.inner.state.lock();
        for row in rows {
            if let Some(id) = entity_id(row) {
                state.settle((resource.to_string(), id), Some(row.clone()), issued);
            }
        }
    }

    fn schedule_dispatch(&self, resource: String) {
        let loader = self.clone();
        let window = self.inner.config.batch_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            loader.dispatch(resource).await;
        });
    }

    async fn dispatch(&self, resource: String) {
        let (ids, issued) = {
            let mut state = self.inner.state.lock();
            let Some(batch) = state.pending.remove(&resource) else {
                return;
            };
            for (id, waiters) in batch.waiters {
                state
                    .in_flight
                    .entry((resource.clone(), id))
                    .or_default()
                    .extend(waiters);
            }
            (batch.ids, state.clock)
        };

        let table = self.inner.registry.table_name(&resource);
        for chunk in ids.chunks(self.inner.config.max_batch_size.max(1)) {
            let result = self.inner.storage.find_many(&table, chunk).await;
            self.inner.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.inner.counters.keys.fetch_add(chunk.len(), Ordering::Relaxed);
            tracing::debug!(resource = %resource, keys = chunk.len(), "batch dispatched");
            self.complete(&resource, chunk, result, issued);
        }
    }

    fn complete(&self, resource: &str, ids: &[String], result: EngineResult<Vec<Value>>, issued: u64) {
        let mut state = self.inner.state.lock();
        match result {
            Ok(rows) => {
                let mut by_id: HashMap<String, Value> = rows
                    .into_iter()
                    .filter_map(|row| entity_id(&row).map(|id| (id, row)))
                    .collect();
                for id in ids {
                    let key = (resource.to_string(), id.clone());
                    let value = state.settle(key.clone(), by_id.remove(id), issued);
                    for waiter in state.in_flight.remove(&key).unwrap_or_default() {
                        let _ = waiter.send(Ok(value.clone()));
                    }
                }
            }
            Err(err) => {
                // failures are not cached so a later load retries
                tracing::warn!(resource, keys = ids.len(), error = %err, "batch fetch failed");
                for id in ids {
                    let key = (resource.to_string(), id.clone());
                    for waiter in state.in_flight.remove(&key).unwrap_or_default() {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BatchLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}
