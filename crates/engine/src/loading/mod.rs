//! Loading: the batching loader plus query analysis, planning and execution

pub mod batch_loader;
pub mod optimizer;

pub use batch_loader::{BatchLoader, LoaderConfig, LoaderStats};
pub use optimizer::{
    ExecutionPlan, ExecutionStats, QueryAnalysis, QueryAnalyzer, QueryContext, QueryExecutor,
    QueryPlanner, QueryResult, QueryStep, RootQuery, StepKind, StepResult, StepStatus, Strategy,
    TraversalNode,
};
