pub mod analyzer;
pub mod executor;
pub mod plan;

#[cfg(test)]
pub(crate) mod test_support;

pub use analyzer::{QueryAnalysis, QueryAnalyzer, TraversalNode};
pub use executor::{
    ExecutionStats, QueryContext, QueryExecutor, QueryResult, RootQuery, StepResult, StepStatus,
    StepTiming,
};
pub use plan::{ExecutionPlan, QueryPlanner, QueryStep, StepKind, Strategy};
