use crate::config::EngineConfig;
use std::time::Duration;

/// Configuration for batch loading operations
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// How long point loads are collected before one batched fetch
    pub batch_window: Duration,
    /// Maximum number of ids sent to storage in a single fetch
    pub max_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(2),
            max_batch_size: 1000,
        }
    }
}

impl From<&EngineConfig> for LoaderConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_window: *config.get_batch_window(),
            max_batch_size: (*config.get_max_batch_size()).max(1),
        }
    }
}

/// Loader statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Entries in the request cache, including cached misses
    pub cached_entries: usize,
    /// Point loads answered from the cache
    pub cache_hits: usize,
    /// Batched `find_many` calls issued
    pub batches_dispatched: usize,
    /// Ids sent to storage across all batches
    pub keys_fetched: usize,
    /// Grouped `find_by_field` calls issued
    pub field_queries: usize,
}
