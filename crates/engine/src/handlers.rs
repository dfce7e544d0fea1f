//! Per-resource operations
//!
//! Reads are planned and executed against the request's loader; lazy plans
//! have their deferred relationships filled in before returning. Writes and
//! subscriptions delegate to the engine's mutation handler and subscription
//! manager.

use crate::engine::{Engine, RequestContext};
use crate::error::EngineResult;
use crate::loading::optimizer::executor::resolve_deferred;
use crate::loading::{ExecutionPlan, QueryContext, QueryResult};
use crate::mutations::MutationOptions;
use crate::resource::Resource;
use crate::selection::{QueryOptions, SelectionSet};
use crate::subscriptions::{ListSubscribeOptions, SubscribeOptions, Subscription};
use serde_json::Value;
use std::sync::Arc;

/// Handlers bound to one registered resource
#[derive(Clone)]
pub struct ResourceHandlers {
    engine: Engine,
    resource: Arc<Resource>,
}

impl ResourceHandlers {
    pub(crate) fn new(engine: Engine, resource: Arc<Resource>) -> Self {
        Self { engine, resource }
    }

    pub fn name(&self) -> &str {
        self.resource.name()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// The plan a read with `selection` would run
    pub fn plan(&self, selection: &SelectionSet) -> EngineResult<ExecutionPlan> {
        self.engine.planner().generate_execution_plan(self.name(), selection)
    }

    /// One entity shaped by `selection`; `null` when it does not exist
    pub async fn get(&self, request: &RequestContext, id: &str, selection: &SelectionSet) -> EngineResult<Value> {
        let context = QueryContext::by_id(request.loader().clone(), id);
        self.read(request, &context, selection).await
    }

    /// Entities matching `options`, each shaped by `selection`
    pub async fn list(
        &self,
        request: &RequestContext,
        options: QueryOptions,
        selection: &SelectionSet,
    ) -> EngineResult<Value> {
        let context = QueryContext::list(request.loader().clone(), options);
        self.read(request, &context, selection).await
    }

    /// Entities by id in the given order; missing ones are `null`
    pub async fn get_many(
        &self,
        request: &RequestContext,
        ids: Vec<String>,
        selection: &SelectionSet,
    ) -> EngineResult<Value> {
        let context = QueryContext::by_ids(request.loader().clone(), ids);
        self.read(request, &context, selection).await
    }

    /// Runs a read and keeps the per-step results, for callers that want
    /// timings or partial failures instead of a single error
    pub async fn execute(
        &self,
        request: &RequestContext,
        id: &str,
        selection: &SelectionSet,
    ) -> EngineResult<QueryResult> {
        let plan = self.plan(selection)?;
        let context = QueryContext::by_id(request.loader().clone(), id);
        self.engine.executor().execute_query_parallel(&plan, &context).await
    }

    async fn read(
        &self,
        request: &RequestContext,
        context: &QueryContext,
        selection: &SelectionSet,
    ) -> EngineResult<Value> {
        let plan = self.plan(selection)?;
        let result = self.engine.executor().execute_query_parallel(&plan, context).await?;
        let mut data = result.into_data()?;
        resolve_deferred(request.loader(), &plan, &mut data).await?;
        Ok(data)
    }

    pub async fn create(&self, request: &RequestContext, input: Value) -> EngineResult<Value> {
        self.create_with(request, input, MutationOptions::default()).await
    }

    pub async fn create_with(
        &self,
        request: &RequestContext,
        input: Value,
        options: MutationOptions,
    ) -> EngineResult<Value> {
        self.engine
            .mutations()
            .create(request.loader(), self.name(), input, options)
            .await
    }

    pub async fn update(&self, request: &RequestContext, id: &str, data: Value) -> EngineResult<Value> {
        self.update_with(request, id, data, MutationOptions::default()).await
    }

    pub async fn update_with(
        &self,
        request: &RequestContext,
        id: &str,
        data: Value,
        options: MutationOptions,
    ) -> EngineResult<Value> {
        self.engine
            .mutations()
            .update(request.loader(), self.name(), id, data, options)
            .await
    }

    /// Deletes and returns the removed entity
    pub async fn delete(&self, request: &RequestContext, id: &str) -> EngineResult<Value> {
        self.delete_with(request, id, MutationOptions::default()).await
    }

    pub async fn delete_with(&self, request: &RequestContext, id: &str, options: MutationOptions) -> EngineResult<Value> {
        self.engine
            .mutations()
            .delete(request.loader(), self.name(), id, options)
            .await
    }

    pub async fn link(
        &self,
        request: &RequestContext,
        id: &str,
        relationship: &str,
        related_id: &str,
    ) -> EngineResult<()> {
        self.engine
            .mutations()
            .link(request.loader(), self.name(), id, relationship, related_id)
            .await
    }

    pub async fn unlink(
        &self,
        request: &RequestContext,
        id: &str,
        relationship: &str,
        related_id: &str,
    ) -> EngineResult<()> {
        self.engine
            .mutations()
            .unlink(request.loader(), self.name(), id, relationship, related_id)
            .await
    }

    /// Live value of one entity; the initial fetch uses the request's loader
    pub async fn subscribe(
        &self,
        request: &RequestContext,
        id: &str,
        options: SubscribeOptions,
    ) -> EngineResult<Subscription<Value>> {
        self.engine
            .subscriptions()
            .subscribe(request.loader(), self.name(), id, options)
            .await
    }

    pub async fn subscribe_list(&self, options: ListSubscribeOptions) -> EngineResult<Subscription<Vec<Value>>> {
        self.engine.subscriptions().subscribe_list(self.name(), options).await
    }
}

impl std::fmt::Debug for ResourceHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandlers")
            .field("resource", &self.resource.name())
            .finish()
    }
}
