use super::analyzer::{QueryAnalysis, QueryAnalyzer};
use crate::error::{EngineError, EngineResult};
use crate::resource::{Cardinality, Resource, ResourceRegistry};
use crate::selection::{QueryOptions, SelectionSet};
use serde::Serialize;
use std::collections::HashSet;

/// Depth at which eager loading is abandoned
const LAZY_DEPTH: usize = 3;
/// Relationship count at which eager loading is abandoned
const LAZY_RELATIONSHIPS: usize = 10;
/// Most relationships a single joined query may carry
const JOIN_MAX_RELATIONSHIPS: usize = 2;

/// How a plan fetches related data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Root query resolves its relationships inline
    Join,
    /// One grouped query per traversed relationship
    Batch,
    /// Root only; relationships resolved on demand
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Root,
    Relationship,
    Computed,
}

/// One unit of work in an execution plan
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStep {
    pub index: usize,
    pub kind: StepKind,
    /// Resource whose rows this step produces (or annotates, for computed steps)
    pub resource: String,
    /// Relationship traversed by a relationship step
    pub relationship: Option<String>,
    /// Resource that declares `relationship`
    pub parent: Option<String>,
    pub strategy: Strategy,
    /// Columns to keep; computed steps name the field they evaluate
    pub fields: Vec<String>,
    /// Steps that must have finished before this one starts
    pub dependencies: Vec<usize>,
    pub cardinality: Cardinality,
    /// Hint that the step can run alongside its siblings
    pub parallelizable: bool,
    /// Selection applied to this step's rows
    pub selection: SelectionSet,
    /// Filtering and paging applied to each parent's group of rows
    pub options: QueryOptions,
}

/// Dependency-annotated steps satisfying a selection
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub resource: String,
    pub strategy: Strategy,
    pub steps: Vec<QueryStep>,
    /// Equals the number of steps
    pub estimated_queries: usize,
    pub analysis: QueryAnalysis,
    pub optimizations: Vec<String>,
}

impl ExecutionPlan {
    pub fn root(&self) -> Option<&QueryStep> {
        self.steps.first()
    }

    /// Steps whose structural parent is `index`
    pub fn children_of(&self, index: usize) -> impl Iterator<Item = &QueryStep> {
        self.steps
            .iter()
            .filter(move |step| step.dependencies.first() == Some(&index))
    }

    pub fn parallelizable_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.parallelizable).count()
    }

    /// Checks dependency indices are in range and acyclic
    pub fn validate(&self) -> EngineResult<()> {
        for step in &self.steps {
            for &dependency in &step.dependencies {
                if dependency >= self.steps.len() || dependency == step.index {
                    return Err(EngineError::Query(format!(
                        "step {} has an invalid dependency {}",
                        step.index, dependency
                    )));
                }
            }
        }

        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        for step in &self.steps {
            if self.has_cycle(step.index, &mut visited, &mut on_stack) {
                return Err(EngineError::Query(format!(
                    "dependency cycle through step {}",
                    step.index
                )));
            }
        }
        Ok(())
    }

    fn has_cycle(&self, index: usize, visited: &mut HashSet<usize>, on_stack: &mut HashSet<usize>) -> bool {
        if on_stack.contains(&index) {
            return true;
        }
        if !visited.insert(index) {
            return false;
        }
        on_stack.insert(index);
        let cyclic = self.steps[index]
            .dependencies
            .iter()
            .any(|&dep| self.has_cycle(dep, visited, on_stack));
        on_stack.remove(&index);
        cyclic
    }
}

/// Chooses a strategy and lays out steps
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    registry: ResourceRegistry,
    analyzer: QueryAnalyzer,
}

impl QueryPlanner {
    pub fn new(registry: ResourceRegistry) -> Self {
        Self {
            analyzer: QueryAnalyzer::new(registry.clone()),
            registry,
        }
    }

    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.analyzer
    }

    pub fn decide_strategy(analysis: &QueryAnalysis) -> Strategy {
        let relationships = analysis.relationships.len();
        if analysis.depth >= LAZY_DEPTH || relationships >= LAZY_RELATIONSHIPS {
            Strategy::Lazy
        } else if analysis.has_n_plus_one {
            Strategy::Batch
        } else if analysis.depth == 1 && relationships <= JOIN_MAX_RELATIONSHIPS {
            Strategy::Join
        } else {
            Strategy::Batch
        }
    }

    pub fn generate_execution_plan(&self, resource: &str, selection: &SelectionSet) -> EngineResult<ExecutionPlan> {
        let analysis = self.analyzer.analyze_query(resource, selection)?;
        let strategy = Self::decide_strategy(&analysis);
        let root = self.registry.require(resource)?;

        let root_fields = match strategy {
            Strategy::Join => selection.keys().map(str::to_string).collect(),
            Strategy::Batch | Strategy::Lazy => scalar_fields(&root, selection),
        };

        let mut steps = vec![QueryStep {
            index: 0,
            kind: StepKind::Root,
            resource: resource.to_string(),
            relationship: None,
            parent: None,
            strategy,
            fields: root_fields,
            dependencies: Vec::new(),
            cardinality: Cardinality::Many,
            parallelizable: false,
            selection: selection.clone(),
            options: QueryOptions::default(),
        }];

        let mut optimizations = Vec::new();
        match strategy {
            Strategy::Join => {
                optimizations.push(format!(
                    "{} relationship(s) resolved inline with the root query",
                    analysis.relationships.len()
                ));
            }
            Strategy::Batch => {
                self.push_batch_steps(&mut steps, 0, &root, selection)?;
                if analysis.has_n_plus_one {
                    optimizations.push("N+1 batched into per-relationship queries".to_string());
                } else {
                    optimizations.push("relationships loaded with one grouped query each".to_string());
                }
                let parallel = steps.iter().filter(|step| step.parallelizable).count();
                if parallel > 1 {
                    optimizations.push(format!("{} steps can run concurrently after the root", parallel));
                }
                let computed = steps.iter().filter(|s| s.kind == StepKind::Computed).count();
                if computed > 0 {
                    optimizations.push(format!("{} computed field(s) evaluated after their rows load", computed));
                }
            }
            Strategy::Lazy => {
                optimizations.push(format!(
                    "depth {} with {} relationships exceeds eager limits; relationships deferred",
                    analysis.depth,
                    analysis.relationships.len()
                ));
            }
        }

        let plan = ExecutionPlan {
            resource: resource.to_string(),
            strategy,
            estimated_queries: steps.len(),
            steps,
            analysis,
            optimizations,
        };
        plan.validate()?;

        tracing::debug!(
            resource,
            strategy = ?plan.strategy,
            steps = plan.steps.len(),
            "execution plan generated"
        );
        Ok(plan)
    }

    fn push_batch_steps(
        &self,
        steps: &mut Vec<QueryStep>,
        owner: usize,
        resource: &Resource,
        selection: &SelectionSet,
    ) -> EngineResult<()> {
        let owner_cardinality = steps[owner].cardinality;

        for key in selection.keys().filter(|key| resource.is_computed(key)) {
            steps.push(QueryStep {
                index: steps.len(),
                kind: StepKind::Computed,
                resource: resource.name().to_string(),
                relationship: None,
                parent: None,
                strategy: Strategy::Batch,
                fields: vec![key.to_string()],
                dependencies: vec![owner],
                cardinality: owner_cardinality,
                parallelizable: owner == 0,
                selection: SelectionSet::new(),
                options: QueryOptions::default(),
            });
        }

        for key in selection.keys() {
            let Some(relationship) = resource.relationship(key) else {
                continue;
            };
            let target = self.registry.require(relationship.target())?;
            let nested = selection.nested(key).unwrap_or_default();

            let index = steps.len();
            steps.push(QueryStep {
                index,
                kind: StepKind::Relationship,
                resource: target.name().to_string(),
                relationship: Some(key.to_string()),
                parent: Some(resource.name().to_string()),
                strategy: Strategy::Batch,
                fields: scalar_fields(&target, &nested.selection),
                dependencies: vec![owner],
                cardinality: relationship.cardinality(),
                parallelizable: owner == 0,
                selection: nested.selection.clone(),
                options: nested.options.clone(),
            });
            self.push_batch_steps(steps, index, &target, &nested.selection)?;
        }
        Ok(())
    }
}

/// Selected keys that are neither relationships nor computed fields
pub(crate) fn scalar_fields(resource: &Resource, selection: &SelectionSet) -> Vec<String> {
    selection
        .keys()
        .filter(|key| !resource.is_relationship(key) && !resource.is_computed(key))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::optimizer::test_support::blog_registry;
    use std::collections::BTreeMap;

    fn analysis(depth: usize, relationships: usize, has_n_plus_one: bool) -> QueryAnalysis {
        QueryAnalysis {
            resource: "user".to_string(),
            depth,
            relationships: (0..relationships).map(|n| format!("rel{}", n)).collect(),
            estimated_queries: relationships + 1,
            has_n_plus_one,
            traversal_tree: Vec::new(),
            relationships_by_depth: BTreeMap::new(),
            complexity: 0,
        }
    }

    #[test]
    fn test_decide_strategy_thresholds() {
        assert_eq!(QueryPlanner::decide_strategy(&analysis(1, 2, false)), Strategy::Join);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(1, 1, true)), Strategy::Batch);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(2, 9, true)), Strategy::Batch);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(1, 3, false)), Strategy::Batch);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(2, 2, false)), Strategy::Batch);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(0, 0, false)), Strategy::Batch);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(3, 3, true)), Strategy::Lazy);
        assert_eq!(QueryPlanner::decide_strategy(&analysis(1, 10, true)), Strategy::Lazy);
    }

    #[test]
    fn test_join_plan_has_single_step() {
        let planner = QueryPlanner::new(blog_registry());
        let selection = SelectionSet::new()
            .field("title")
            .relation("author", SelectionSet::new().field("name"));
        let plan = planner.generate_execution_plan("post", &selection).unwrap();

        assert_eq!(plan.strategy, Strategy::Join);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.estimated_queries, 1);
        assert_eq!(plan.steps[0].fields, vec!["title", "author"]);
        assert!(!plan.steps[0].parallelizable);
        assert!(plan.steps[0].dependencies.is_empty());
    }

    #[test]
    fn test_batch_plan_one_step_per_node() {
        let planner = QueryPlanner::new(blog_registry());
        let selection = SelectionSet::new()
            .field("name")
            .relation(
                "posts",
                SelectionSet::new()
                    .field("title")
                    .relation("comments", SelectionSet::new().field("body")),
            );
        let plan = planner.generate_execution_plan("user", &selection).unwrap();

        assert_eq!(plan.strategy, Strategy::Batch);
        assert_eq!(plan.steps.len(), plan.analysis.node_count() + 1);
        assert_eq!(plan.estimated_queries, 3);

        assert_eq!(plan.steps[0].fields, vec!["name"]);
        let posts = &plan.steps[1];
        assert_eq!(posts.relationship.as_deref(), Some("posts"));
        assert_eq!(posts.dependencies, vec![0]);
        assert!(posts.parallelizable);
        assert_eq!(posts.cardinality, Cardinality::Many);

        let comments = &plan.steps[2];
        assert_eq!(comments.dependencies, vec![1]);
        assert!(!comments.parallelizable);
        assert_eq!(comments.parent.as_deref(), Some("post"));
        assert!(plan
            .optimizations
            .iter()
            .any(|note| note.contains("N+1 batched")));
    }

    #[test]
    fn test_lazy_plan_keeps_root_only() {
        let planner = QueryPlanner::new(blog_registry());
        let selection = SelectionSet::new().field("name").relation(
            "posts",
            SelectionSet::new().relation(
                "comments",
                SelectionSet::new().relation("author", SelectionSet::new().field("name")),
            ),
        );
        let plan = planner.generate_execution_plan("user", &selection).unwrap();

        assert_eq!(plan.analysis.depth, 3);
        assert_eq!(plan.strategy, Strategy::Lazy);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].fields, vec!["name"]);
    }

    #[test]
    fn test_computed_fields_get_their_own_steps() {
        let planner = QueryPlanner::new(blog_registry());
        let selection = SelectionSet::new()
            .fields(["name", "postCount"])
            .relation("posts", SelectionSet::new().field("title"));
        let plan = planner.generate_execution_plan("user", &selection).unwrap();

        assert_eq!(plan.strategy, Strategy::Batch);
        assert_eq!(plan.steps.len(), 3);
        let computed = plan
            .steps
            .iter()
            .find(|step| step.kind == StepKind::Computed)
            .unwrap();
        assert_eq!(computed.fields, vec!["postCount"]);
        assert_eq!(computed.dependencies, vec![0]);
        assert_eq!(plan.steps[0].fields, vec!["name"]);
    }

    #[test]
    fn test_validate_rejects_cycles() {
        let planner = QueryPlanner::new(blog_registry());
        let selection = SelectionSet::new().relation("posts", SelectionSet::new().field("title"));
        let mut plan = planner.generate_execution_plan("user", &selection).unwrap();
        plan.validate().unwrap();

        plan.steps[0].dependencies = vec![1];
        assert!(plan.validate().is_err());

        plan.steps[0].dependencies = vec![7];
        assert!(plan.validate().is_err());
    }
}
