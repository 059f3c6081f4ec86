pub mod context;
pub mod dag;
pub mod executor;
pub mod step_executor;

pub use context::ExecutionContext;
pub use dag::plan;
pub use executor::WorkflowEngine;
pub use step_executor::StepExecutor;
