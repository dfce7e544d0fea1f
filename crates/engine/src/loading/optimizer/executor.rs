//! Plan execution
//!
//! Steps run in waves: a step becomes runnable once every step it depends on
//! has completed, and a step whose dependency failed (or was itself aborted)
//! is aborted without running. Results are then folded back into the shape
//! the selection asked for.

use super::plan::{ExecutionPlan, QueryStep, StepKind, Strategy};
use crate::config::EngineConfig;
use crate::error::{BoxError, EngineError, EngineResult};
use crate::loading::BatchLoader;
use crate::resource::{Cardinality, ComputeContext, Relationship, ResourceRegistry};
use crate::selection::{NestedSelection, QueryOptions, SelectionSet};
use crate::value::{entity_id, key_of, project};
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Which root rows a plan is executed against
#[derive(Debug, Clone, PartialEq)]
pub enum RootQuery {
    /// A single entity; the result is an object or null
    ById(String),
    /// Several entities in the given order; missing ids are skipped
    ByIds(Vec<String>),
    List(QueryOptions),
}

/// Everything a plan needs at run time
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub loader: BatchLoader,
    pub root: RootQuery,
}

impl QueryContext {
    pub fn by_id(loader: BatchLoader, id: impl Into<String>) -> Self {
        Self {
            loader,
            root: RootQuery::ById(id.into()),
        }
    }

    pub fn by_ids(loader: BatchLoader, ids: Vec<String>) -> Self {
        Self {
            loader,
            root: RootQuery::ByIds(ids),
        }
    }

    pub fn list(loader: BatchLoader, options: QueryOptions) -> Self {
        Self {
            loader,
            root: RootQuery::List(options),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    Failed,
    /// Not run because a dependency did not complete
    Aborted,
}

/// Outcome of one plan step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub index: usize,
    pub kind: StepKind,
    pub resource: String,
    pub relationship: Option<String>,
    pub status: StepStatus,
    /// Rows fetched, or values computed for computed steps
    pub rows: usize,
    pub elapsed: Duration,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub error: Option<EngineError>,
}

impl StepResult {
    fn aborted(step: &QueryStep, dependency: usize) -> Self {
        Self {
            index: step.index,
            kind: step.kind,
            resource: step.resource.clone(),
            relationship: step.relationship.clone(),
            status: StepStatus::Aborted,
            rows: 0,
            elapsed: Duration::ZERO,
            started_at: None,
            finished_at: None,
            error: Some(EngineError::StepAborted {
                index: step.index,
                dependency,
            }),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Result of executing a plan
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Assembled data; `None` unless every step completed
    pub data: Option<Value>,
    /// One entry per plan step, in step order
    pub steps: Vec<StepResult>,
    pub plan: ExecutionPlan,
    pub total_duration: Duration,
}

impl QueryResult {
    pub fn is_success(&self) -> bool {
        self.data.is_some()
    }

    /// Error of the first failed step
    pub fn first_error(&self) -> Option<&EngineError> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Failed)
            .and_then(|step| step.error.as_ref())
    }

    /// The assembled data, or the failing step as an error
    pub fn into_data(self) -> EngineResult<Value> {
        if let Some(data) = self.data {
            return Ok(data);
        }
        match self.steps.iter().find(|step| step.status == StepStatus::Failed) {
            Some(StepResult {
                error: Some(err @ EngineError::Timeout { .. }),
                ..
            }) => Err(err.clone()),
            Some(step) => Err(EngineError::StepFailed {
                index: step.index,
                resource: step.resource.clone(),
                message: step
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            }),
            None => Err(EngineError::Query("query produced no data".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepTiming {
    pub index: usize,
    pub resource: String,
    pub elapsed: Duration,
}

/// Summary figures for a finished execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStats {
    pub avg_step_time: Duration,
    pub slowest_step: Option<StepTiming>,
    pub fastest_step: Option<StepTiming>,
    pub total_rows: usize,
    /// Share of the naive query count saved by the plan, in `[0, 1]`
    pub efficiency: f64,
}

#[derive(Debug, Default)]
struct StepOutput {
    rows: Vec<Value>,
    /// Relationship steps: rows grouped under their parent's id
    grouped: HashMap<String, Vec<Value>>,
    /// Computed steps: value per owner id
    computed: HashMap<String, Value>,
}

impl StepOutput {
    fn row_count(&self) -> usize {
        self.rows.len() + self.computed.len()
    }
}

/// Runs execution plans against a request's loader
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    max_parallel_steps: usize,
    step_timeout: Duration,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl QueryExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_limits(*config.get_max_parallel_steps(), *config.get_step_timeout())
    }

    pub fn with_limits(max_parallel_steps: usize, step_timeout: Duration) -> Self {
        Self {
            max_parallel_steps: max_parallel_steps.max(1),
            step_timeout,
        }
    }

    /// Run steps one at a time in dependency order
    pub async fn execute_query(&self, plan: &ExecutionPlan, context: &QueryContext) -> EngineResult<QueryResult> {
        self.run(plan, context, 1).await
    }

    /// Run every runnable step concurrently, up to `max_parallel_steps` at once
    pub async fn execute_query_parallel(
        &self,
        plan: &ExecutionPlan,
        context: &QueryContext,
    ) -> EngineResult<QueryResult> {
        self.run(plan, context, self.max_parallel_steps).await
    }

    pub fn get_execution_stats(result: &QueryResult) -> ExecutionStats {
        if result.steps.is_empty() {
            return ExecutionStats {
                avg_step_time: Duration::ZERO,
                slowest_step: None,
                fastest_step: None,
                total_rows: 0,
                efficiency: 0.0,
            };
        }

        let timings: Vec<StepTiming> = result
            .steps
            .iter()
            .map(|step| StepTiming {
                index: step.index,
                resource: step.resource.clone(),
                elapsed: step.elapsed,
            })
            .collect();
        let total: Duration = timings.iter().map(|t| t.elapsed).sum();

        let estimated = result.plan.analysis.estimated_queries;
        let efficiency = if estimated > 0 {
            (1.0 - result.plan.estimated_queries as f64 / estimated as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        ExecutionStats {
            avg_step_time: total / timings.len() as u32,
            slowest_step: timings.iter().max_by_key(|t| t.elapsed).cloned(),
            fastest_step: timings.iter().min_by_key(|t| t.elapsed).cloned(),
            total_rows: result.steps.iter().map(|step| step.rows).sum(),
            efficiency,
        }
    }

    async fn run(&self, plan: &ExecutionPlan, context: &QueryContext, concurrency: usize) -> EngineResult<QueryResult> {
        plan.validate()?;
        let started = Instant::now();
        let count = plan.steps.len();
        let mut results: Vec<Option<StepResult>> = vec![None; count];
        let mut outputs: Vec<Option<StepOutput>> = (0..count).map(|_| None).collect();

        loop {
            abort_orphans(plan, &mut results);

            let runnable: Vec<&QueryStep> = plan
                .steps
                .iter()
                .filter(|step| results[step.index].is_none())
                .filter(|step| step.dependencies.iter().all(|&dep| outputs[dep].is_some()))
                .collect();
            if runnable.is_empty() {
                break;
            }

            for wave in runnable.chunks(concurrency) {
                let finished = join_all(
                    wave.iter()
                        .map(|step| self.run_step(plan, step, context, &outputs)),
                )
                .await;
                for (result, output) in finished {
                    let index = result.index;
                    outputs[index] = output;
                    results[index] = Some(result);
                }
            }
        }

        let steps: Vec<StepResult> = results.into_iter().flatten().collect();
        let data = if steps.len() == count && steps.iter().all(StepResult::is_completed) {
            Some(assemble(plan, context, &outputs))
        } else {
            None
        };

        let total_duration = started.elapsed();
        tracing::debug!(
            resource = %plan.resource,
            strategy = ?plan.strategy,
            steps = count,
            success = data.is_some(),
            elapsed_ms = total_duration.as_millis() as u64,
            "plan executed"
        );

        Ok(QueryResult {
            data,
            steps,
            plan: plan.clone(),
            total_duration,
        })
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step: &QueryStep,
        context: &QueryContext,
        outputs: &[Option<StepOutput>],
    ) -> (StepResult, Option<StepOutput>) {
        let started_at = Instant::now();
        let outcome = tokio::time::timeout(self.step_timeout, execute_step(plan, step, context, outputs))
            .await
            .unwrap_or(Err(EngineError::Timeout {
                index: step.index,
                timeout: self.step_timeout,
            }));
        let finished_at = Instant::now();

        let mut result = StepResult {
            index: step.index,
            kind: step.kind,
            resource: step.resource.clone(),
            relationship: step.relationship.clone(),
            status: StepStatus::Completed,
            rows: 0,
            elapsed: finished_at.duration_since(started_at),
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            error: None,
        };

        match outcome {
            Ok(output) => {
                result.rows = output.row_count();
                tracing::debug!(
                    step = step.index,
                    resource = %step.resource,
                    rows = result.rows,
                    elapsed_us = result.elapsed.as_micros() as u64,
                    "step completed"
                );
                (result, Some(output))
            }
            Err(err) => {
                tracing::error!(step = step.index, resource = %step.resource, error = %err, "step failed");
                result.status = StepStatus::Failed;
                result.error = Some(err);
                (result, None)
            }
        }
    }
}

fn abort_orphans(plan: &ExecutionPlan, results: &mut [Option<StepResult>]) {
    let mut changed = true;
    while changed {
        changed = false;
        for step in &plan.steps {
            if results[step.index].is_some() {
                continue;
            }
            let broken = step.dependencies.iter().copied().find(|&dep| {
                results[dep]
                    .as_ref()
                    .is_some_and(|result| result.status != StepStatus::Completed)
            });
            if let Some(dependency) = broken {
                tracing::warn!(step = step.index, dependency, "step aborted");
                results[step.index] = Some(StepResult::aborted(step, dependency));
                changed = true;
            }
        }
    }
}

async fn execute_step(
    plan: &ExecutionPlan,
    step: &QueryStep,
    context: &QueryContext,
    outputs: &[Option<StepOutput>],
) -> EngineResult<StepOutput> {
    let loader = &context.loader;
    match step.kind {
        StepKind::Root => {
            let mut rows = fetch_root(loader, &step.resource, &context.root).await?;
            match plan.strategy {
                Strategy::Join => resolve_into(loader, &step.resource, &mut rows, &step.selection).await?,
                Strategy::Lazy => attach_computed(loader, &step.resource, &mut rows, &step.selection).await?,
                Strategy::Batch => {}
            }
            Ok(StepOutput {
                rows,
                ..StepOutput::default()
            })
        }
        StepKind::Relationship => {
            let parents = owner_rows(step, outputs)?;
            let (Some(parent), Some(name)) = (step.parent.as_deref(), step.relationship.as_deref()) else {
                return Err(EngineError::Query(format!(
                    "relationship step {} is missing its relationship",
                    step.index
                )));
            };
            let relationship = loader.registry().relationship(parent, name)?;
            let mut grouped = load_related(loader, &relationship, parents).await?;
            if !step.options.is_empty() {
                for rows in grouped.values_mut() {
                    *rows = step.options.apply(std::mem::take(rows));
                }
            }

            // children shared by several parents are kept once
            let mut seen = HashSet::new();
            let rows = parents
                .iter()
                .filter_map(entity_id)
                .filter_map(|id| grouped.get(&id))
                .flatten()
                .filter(|row| entity_id(row).map_or(true, |id| seen.insert(id)))
                .cloned()
                .collect();

            Ok(StepOutput {
                rows,
                grouped,
                computed: HashMap::new(),
            })
        }
        StepKind::Computed => {
            let owners = owner_rows(step, outputs)?;
            let Some(name) = step.fields.first() else {
                return Err(EngineError::Query(format!("computed step {} names no field", step.index)));
            };
            let resource = loader.registry().require(&step.resource)?;
            let field = resource.computed_field(name).ok_or_else(|| {
                EngineError::Query(format!("'{}' is not a computed field of '{}'", name, step.resource))
            })?;

            let ctx = &ComputeContext {
                resource: step.resource.clone(),
                loader: loader.clone(),
            };
            let evaluations = owners
                .iter()
                .filter_map(|row| entity_id(row).map(|id| (id, row)))
                .map(|(id, row)| async move {
                    let value = field
                        .evaluate(row, ctx)
                        .await
                        .map_err(|err| computed_error(&step.resource, name, err))?;
                    Ok::<_, EngineError>((id, value))
                });

            Ok(StepOutput {
                computed: try_join_all(evaluations).await?.into_iter().collect(),
                ..StepOutput::default()
            })
        }
    }
}

fn owner_rows<'a>(step: &QueryStep, outputs: &'a [Option<StepOutput>]) -> EngineResult<&'a [Value]> {
    step.dependencies
        .first()
        .and_then(|&dep| outputs[dep].as_ref())
        .map(|output| output.rows.as_slice())
        .ok_or_else(|| EngineError::Query(format!("step {} ran before its owner step", step.index)))
}

fn computed_error(resource: &str, field: &str, err: BoxError) -> EngineError {
    EngineError::Computed {
        resource: resource.to_string(),
        field: field.to_string(),
        message: err.to_string(),
    }
}

async fn fetch_root(loader: &BatchLoader, resource: &str, root: &RootQuery) -> EngineResult<Vec<Value>> {
    match root {
        RootQuery::ById(id) => Ok(loader.load(resource, id).await?.into_iter().collect()),
        RootQuery::ByIds(ids) => Ok(loader.load_many(resource, ids).await?.into_iter().flatten().collect()),
        RootQuery::List(options) => loader.query(resource, options).await,
    }
}

fn parent_ids(parents: &[Value]) -> Vec<String> {
    parents.iter().filter_map(entity_id).collect()
}

fn unique(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values.into_iter().filter(|value| seen.insert(value.clone())).collect()
}

/// Rows related to each parent, keyed by parent id
async fn load_related(
    loader: &BatchLoader,
    relationship: &Relationship,
    parents: &[Value],
) -> EngineResult<HashMap<String, Vec<Value>>> {
    let target = relationship.target();
    match relationship {
        Relationship::HasMany {
            foreign_key,
            order_by,
            through: None,
            ..
        } => {
            loader
                .load_by_field_ordered(target, foreign_key, &parent_ids(parents), order_by.as_ref())
                .await
        }
        Relationship::HasMany {
            foreign_key,
            order_by,
            through: Some(through),
            ..
        } => {
            let mut grouped = load_through(
                loader,
                target,
                &through.table,
                foreign_key,
                &through.target_foreign_key,
                &parent_ids(parents),
            )
            .await?;
            if let Some(order) = order_by {
                for rows in grouped.values_mut() {
                    order.sort(rows);
                }
            }
            Ok(grouped)
        }
        Relationship::ManyToMany {
            foreign_key,
            through,
            target_foreign_key,
            ..
        } => load_through(loader, target, through, foreign_key, target_foreign_key, &parent_ids(parents)).await,
        Relationship::HasOne { foreign_key, .. } => {
            let mut grouped = loader.load_by_field(target, foreign_key, &parent_ids(parents)).await?;
            for rows in grouped.values_mut() {
                rows.truncate(1);
            }
            Ok(grouped)
        }
        Relationship::BelongsTo { foreign_key, .. } => {
            let mut grouped: HashMap<String, Vec<Value>> =
                parent_ids(parents).into_iter().map(|id| (id, Vec::new())).collect();
            let links: Vec<(String, String)> = parents
                .iter()
                .filter_map(|parent| Some((entity_id(parent)?, parent.get(foreign_key).and_then(key_of)?)))
                .collect();

            let ids = unique(links.iter().map(|(_, fk)| fk.clone()));
            let targets = loader.load_many(target, &ids).await?;
            let by_id: HashMap<&str, Value> = ids
                .iter()
                .map(String::as_str)
                .zip(targets)
                .filter_map(|(id, row)| row.map(|row| (id, row)))
                .collect();

            for (parent, fk) in links {
                if let Some(row) = by_id.get(fk.as_str()) {
                    grouped.entry(parent).or_default().push(row.clone());
                }
            }
            Ok(grouped)
        }
    }
}

/// Follows join rows in `table` from parent ids to target entities
async fn load_through(
    loader: &BatchLoader,
    target: &str,
    table: &str,
    foreign_key: &str,
    target_foreign_key: &str,
    parent_ids: &[String],
) -> EngineResult<HashMap<String, Vec<Value>>> {
    let links = loader.load_by_field(table, foreign_key, parent_ids).await?;
    let target_ids = unique(
        links
            .values()
            .flatten()
            .filter_map(|link| link.get(target_foreign_key).and_then(key_of)),
    );
    let targets = loader.load_many(target, &target_ids).await?;
    let by_id: HashMap<String, Value> = target_ids
        .into_iter()
        .zip(targets)
        .filter_map(|(id, row)| row.map(|row| (id, row)))
        .collect();

    Ok(links
        .into_iter()
        .map(|(parent, rows)| {
            let related = rows
                .iter()
                .filter_map(|link| link.get(target_foreign_key).and_then(key_of))
                .filter_map(|id| by_id.get(&id).cloned())
                .collect();
            (parent, related)
        })
        .collect())
}

/// Evaluates the selected computed fields of `resource` onto each row
async fn attach_computed(
    loader: &BatchLoader,
    resource: &str,
    rows: &mut [Value],
    selection: &SelectionSet,
) -> EngineResult<()> {
    let definition = loader.registry().require(resource)?;
    let ctx = ComputeContext {
        resource: resource.to_string(),
        loader: loader.clone(),
    };

    for key in selection.keys() {
        let Some(field) = definition.computed_field(key) else {
            continue;
        };
        let values = try_join_all(rows.iter().map(|row| field.evaluate(row, &ctx)))
            .await
            .map_err(|err| computed_error(resource, key, err))?;
        for (row, value) in rows.iter_mut().zip(values) {
            if let Value::Object(object) = row {
                object.insert(key.to_string(), value);
            }
        }
    }
    Ok(())
}

fn selected_keys(selection: &SelectionSet) -> Vec<String> {
    selection.keys().map(str::to_string).collect()
}

/// Resolves every selected relationship and computed field of `resource`
/// into `rows`, recursively. Children are projected to their selection.
pub fn resolve_into<'a>(
    loader: &'a BatchLoader,
    resource: &'a str,
    rows: &'a mut [Value],
    selection: &'a SelectionSet,
) -> BoxFuture<'a, EngineResult<()>> {
    async move {
        resolve_relationships_into(loader, resource, rows, selection).await?;
        attach_computed(loader, resource, rows, selection).await
    }
    .boxed()
}

fn resolve_relationships_into<'a>(
    loader: &'a BatchLoader,
    resource: &'a str,
    rows: &'a mut [Value],
    selection: &'a SelectionSet,
) -> BoxFuture<'a, EngineResult<()>> {
    async move {
        let definition = loader.registry().require(resource)?;
        for key in selection.keys() {
            let Some(relationship) = definition.relationship(key) else {
                continue;
            };
            let cardinality = relationship.cardinality();
            let nested = selection.nested(key).unwrap_or_default();
            let mut grouped = resolve_relationship(loader, resource, key, rows, &nested).await?;

            for row in rows.iter_mut() {
                let related = entity_id(row).and_then(|id| grouped.remove(&id)).unwrap_or_default();
                let value = match cardinality {
                    Cardinality::Many => Value::Array(related),
                    Cardinality::One => related.into_iter().next().unwrap_or(Value::Null),
                };
                if let Value::Object(object) = row {
                    object.insert(key.to_string(), value);
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Loads one relationship for `parents`, keyed by parent id, with the nested
/// selection resolved and applied to the children
pub fn resolve_relationship<'a>(
    loader: &'a BatchLoader,
    resource: &'a str,
    name: &'a str,
    parents: &'a [Value],
    nested: &'a NestedSelection,
) -> BoxFuture<'a, EngineResult<HashMap<String, Vec<Value>>>> {
    async move {
        let relationship = loader.registry().relationship(resource, name)?;
        let mut grouped = load_related(loader, &relationship, parents).await?;
        if !nested.options.is_empty() {
            for rows in grouped.values_mut() {
                *rows = nested.options.apply(std::mem::take(rows));
            }
        }

        let mut seen = HashSet::new();
        let mut children: Vec<Value> = grouped
            .values()
            .flatten()
            .filter(|row| entity_id(row).is_some_and(|id| seen.insert(id)))
            .cloned()
            .collect();
        resolve_into(loader, relationship.target(), &mut children, &nested.selection).await?;

        let keys = selected_keys(&nested.selection);
        let shaped: HashMap<String, Value> = children
            .iter()
            .filter_map(|child| entity_id(child).map(|id| (id, project(child, &keys))))
            .collect();

        for rows in grouped.values_mut() {
            for row in rows.iter_mut() {
                if let Some(child) = entity_id(row).and_then(|id| shaped.get(&id)) {
                    *row = child.clone();
                }
            }
        }
        Ok(grouped)
    }
    .boxed()
}

/// Fills in the relationships a lazy plan left out of `data`.
///
/// Lazy results keep each root row's `id` so this can find the rows again;
/// it is dropped here unless the selection asked for it.
pub async fn resolve_deferred(loader: &BatchLoader, plan: &ExecutionPlan, data: &mut Value) -> EngineResult<()> {
    if plan.strategy != Strategy::Lazy {
        return Ok(());
    }
    let Some(root) = plan.root() else {
        return Ok(());
    };

    let mut targets: Vec<&mut Value> = match data {
        Value::Array(items) => items.iter_mut().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };
    let ids: Vec<String> = targets.iter().filter_map(|target| entity_id(target)).collect();
    let mut full: Vec<Value> = loader.load_many(&plan.resource, &ids).await?.into_iter().flatten().collect();
    resolve_relationships_into(loader, &plan.resource, &mut full, &root.selection).await?;

    let definition = loader.registry().require(&plan.resource)?;
    let by_id: HashMap<String, Value> = full
        .into_iter()
        .filter_map(|row| entity_id(&row).map(|id| (id, row)))
        .collect();

    for target in targets.iter_mut() {
        let resolved = entity_id(target).and_then(|id| by_id.get(&id));
        if let (Value::Object(object), Some(resolved)) = (&mut **target, resolved) {
            for key in root.selection.keys().filter(|key| definition.is_relationship(key)) {
                object.insert(key.to_string(), resolved.get(key).cloned().unwrap_or(Value::Null));
            }
        }
        if !root.selection.contains("id") {
            if let Value::Object(object) = &mut **target {
                object.remove("id");
            }
        }
    }
    Ok(())
}

fn assemble(plan: &ExecutionPlan, context: &QueryContext, outputs: &[Option<StepOutput>]) -> Value {
    let registry = context.loader.registry();
    let rows = outputs[0].as_ref().map(|output| output.rows.as_slice()).unwrap_or(&[]);
    let mut shaped = rows.iter().map(|row| shape(registry, plan, 0, row, outputs));
    match &context.root {
        RootQuery::ById(_) => shaped.next().unwrap_or(Value::Null),
        RootQuery::ByIds(_) | RootQuery::List(_) => Value::Array(shaped.collect()),
    }
}

/// Lazy roots also keep their inline computed values and `id`
fn visible_fields(registry: &ResourceRegistry, plan: &ExecutionPlan, step: &QueryStep) -> Vec<String> {
    let mut fields = step.fields.clone();
    if step.kind == StepKind::Root && plan.strategy == Strategy::Lazy {
        if let Some(resource) = registry.get(&step.resource) {
            fields.extend(
                step.selection
                    .keys()
                    .filter(|key| resource.is_computed(key))
                    .map(str::to_string),
            );
        }
        if !fields.iter().any(|field| field == "id") {
            fields.push("id".to_string());
        }
    }
    fields
}

fn shape(
    registry: &ResourceRegistry,
    plan: &ExecutionPlan,
    index: usize,
    row: &Value,
    outputs: &[Option<StepOutput>],
) -> Value {
    let step = &plan.steps[index];
    let mut shaped = if step.selection.is_empty() {
        row.clone()
    } else {
        let fields = visible_fields(registry, plan, step);
        if fields.is_empty() {
            Value::Object(Map::new())
        } else {
            project(row, &fields)
        }
    };

    let Some(id) = entity_id(row) else {
        return shaped;
    };
    if let Value::Object(object) = &mut shaped {
        for child in plan.children_of(index) {
            let Some(output) = outputs[child.index].as_ref() else {
                continue;
            };
            match child.kind {
                StepKind::Computed => {
                    if let (Some(field), Some(value)) = (child.fields.first(), output.computed.get(&id)) {
                        object.insert(field.clone(), value.clone());
                    }
                }
                StepKind::Relationship => {
                    let Some(name) = child.relationship.clone() else {
                        continue;
                    };
                    let related = output.grouped.get(&id).map(Vec::as_slice).unwrap_or(&[]);
                    let value = match child.cardinality {
                        Cardinality::Many => Value::Array(
                            related
                                .iter()
                                .map(|related| shape(registry, plan, child.index, related, outputs))
                                .collect(),
                        ),
                        Cardinality::One => related
                            .first()
                            .map(|related| shape(registry, plan, child.index, related, outputs))
                            .unwrap_or(Value::Null),
                    };
                    object.insert(name, value);
                }
                StepKind::Root => {}
            }
        }
    }
    shaped
}
