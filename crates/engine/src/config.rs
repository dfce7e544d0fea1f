//! Engine configuration types and builders

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::time::Duration;

/// Tuning knobs shared by the loader, executor and subscription manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct EngineConfig {
    /// How long the loader waits to coalesce concurrent point loads
    #[builder(default = "Duration::from_millis(2)", getter)]
    pub batch_window: Duration,

    /// Maximum ids sent to storage in a single batched fetch
    #[builder(default = "1000", getter)]
    pub max_batch_size: usize,

    /// Maximum steps the parallel executor runs at once
    #[builder(default = "10", getter)]
    pub max_parallel_steps: usize,

    /// Timeout applied to each executed step
    #[builder(default = "Duration::from_secs(30)", getter)]
    pub step_timeout: Duration,

    /// Per-channel buffer of the in-memory event bus
    #[builder(default = "256", getter)]
    pub event_capacity: usize,

    /// Recent event ids remembered per subscription for de-duplication
    #[builder(default = "64", getter)]
    pub dedupe_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(2),
            max_batch_size: 1000,
            max_parallel_steps: 10,
            step_timeout: Duration::from_secs(30),
            event_capacity: 256,
            dedupe_window: 64,
        }
    }
}

impl EngineConfig {
    /// Rejects limits the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_batch_size == 0 {
            return Err(EngineError::Configuration("max_batch_size must be at least 1".to_string()));
        }
        if self.max_parallel_steps == 0 {
            return Err(EngineError::Configuration(
                "max_parallel_steps must be at least 1".to_string(),
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(EngineError::Configuration("step_timeout must be positive".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Configuration("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl EngineConfigBuilder {
    /// Development configuration: short timeouts surface slow steps early
    pub fn development() -> Self {
        EngineConfigBuilder::new()
            .batch_window(Duration::from_millis(1))
            .step_timeout(Duration::from_secs(10))
    }

    /// Production configuration with a wider coalescing window
    pub fn production() -> Self {
        EngineConfigBuilder::new()
            .batch_window(Duration::from_millis(5))
            .max_parallel_steps(32)
            .event_capacity(4096)
    }

    /// Testing configuration with minimal latency
    pub fn testing() -> Self {
        EngineConfigBuilder::new()
            .batch_window(Duration::from_millis(1))
            .max_parallel_steps(4)
            .step_timeout(Duration::from_secs(5))
            .event_capacity(64)
    }
}
