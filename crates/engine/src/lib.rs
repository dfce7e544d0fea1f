//! # resource-engine
//!
//! Declarative resources over an abstract storage backend: a registry of
//! resource definitions, a per-request batching loader, a query planner and
//! executor that avoid N+1 fetches, mutation handlers with lifecycle hooks,
//! and live subscriptions fed by an event bus.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod loading;
pub mod mutations;
pub mod resource;
pub mod selection;
pub mod storage;
pub mod subscriptions;
pub mod telemetry;
pub mod value;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::{Engine, EngineBuilder, RequestContext};
pub use error::{BoxError, EngineError, EngineResult};
pub use events::{channels, EventBus, EventKind, EventStream, MemoryEventBus, ResourceEvent};
pub use handlers::ResourceHandlers;
pub use loading::{
    BatchLoader, ExecutionPlan, ExecutionStats, LoaderConfig, LoaderStats, QueryAnalysis, QueryAnalyzer,
    QueryContext, QueryExecutor, QueryPlanner, QueryResult, QueryStep, RootQuery, StepKind, StepResult,
    StepStatus, Strategy,
};
pub use mutations::{MutationHandler, MutationOptions};
pub use resource::{
    Cardinality, ComputeContext, ComputedField, Hook, HookEvent, HookKind, Relationship, RelationshipKind,
    Resource, ResourceDefinition, ResourceRegistry,
};
pub use selection::{OrderBy, QueryOptions, SelectionSet, SortDirection};
pub use storage::{MemoryStorage, StorageBackend};
pub use subscriptions::{ListSubscribeOptions, SubscribeOptions, Subscription, SubscriptionManager, SubscriptionState};
pub use telemetry::{init_logging, LoggingConfig};
