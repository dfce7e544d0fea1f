//! Engine facade
//!
//! Wires the registry, storage, event bus, planner, executor, mutation
//! handler and subscription manager together. Build one per process with
//! [`Engine::builder`]; create a [`RequestContext`] per request so the loader
//! cache never outlives it.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, MemoryEventBus};
use crate::handlers::ResourceHandlers;
use crate::loading::{BatchLoader, LoaderConfig, LoaderStats, QueryExecutor, QueryPlanner};
use crate::mutations::MutationHandler;
use crate::resource::{ResourceDefinition, ResourceRegistry};
use crate::storage::StorageBackend;
use crate::subscriptions::SubscriptionManager;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Builder for configuring an [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    event_bus: Option<Arc<dyn EventBus>>,
    definitions: Vec<ResourceDefinition>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            storage: None,
            event_bus: None,
            definitions: Vec::new(),
        }
    }

    /// Set the persistence backend (required)
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the event bus (defaults to an in-process [`MemoryEventBus`])
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Add a resource definition
    pub fn resource(mut self, definition: ResourceDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn resources<I>(mut self, definitions: I) -> Self
    where
        I: IntoIterator<Item = ResourceDefinition>,
    {
        self.definitions.extend(definitions);
        self
    }

    /// Registers every definition, then checks that every relationship
    /// target exists
    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| EngineError::Configuration("a storage backend is required".to_string()))?;
        let bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(MemoryEventBus::with_capacity(*self.config.get_event_capacity())));

        let registry = ResourceRegistry::new();
        for definition in self.definitions {
            registry.register(definition)?;
        }
        registry.validate_all_relationships()?;

        let engine = Engine {
            planner: QueryPlanner::new(registry.clone()),
            executor: QueryExecutor::new(&self.config),
            mutations: MutationHandler::new(registry.clone(), storage.clone(), bus.clone()),
            subscriptions: SubscriptionManager::new(registry.clone(), storage.clone(), bus.clone(), &self.config),
            loader_config: LoaderConfig::from(&self.config),
            config: self.config,
            registry,
            storage,
            bus,
        };

        info!(resources = engine.registry.len(), "engine ready");
        Ok(engine)
    }
}

/// The assembled engine. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    loader_config: LoaderConfig,
    registry: ResourceRegistry,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<dyn EventBus>,
    planner: QueryPlanner,
    executor: QueryExecutor,
    mutations: MutationHandler,
    subscriptions: SubscriptionManager,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// A fresh request scope with its own loader cache
    pub fn request(&self) -> RequestContext {
        RequestContext {
            request_id: Uuid::new_v4(),
            loader: BatchLoader::new(self.registry.clone(), self.storage.clone(), self.loader_config.clone()),
        }
    }

    /// Operations for one resource
    pub fn handlers(&self, resource: &str) -> EngineResult<ResourceHandlers> {
        let definition = self.registry.require(resource)?;
        Ok(ResourceHandlers::new(self.clone(), definition))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn mutations(&self) -> &MutationHandler {
        &self.mutations
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Ends every live subscription
    pub fn shutdown(&self) {
        self.subscriptions.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("resources", &self.registry.names())
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

/// Per-request scope: one loader, one cache
#[derive(Clone)]
pub struct RequestContext {
    request_id: Uuid,
    loader: BatchLoader,
}

impl RequestContext {
    pub fn id(&self) -> Uuid {
        self.request_id
    }

    pub fn loader(&self) -> &BatchLoader {
        &self.loader
    }

    pub fn stats(&self) -> LoaderStats {
        self.loader.stats()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("loader", &self.loader)
            .finish()
    }
}
