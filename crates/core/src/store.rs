use crate::types::{
    EnvId, Environment, GroupId, LogLevel, RunId, StepExecution, StepId, StepLog, TestCase,
    TestGroup, TestId, TestResult, VariableChange, Workflow, WorkflowId, WorkflowRun,
};
use anyhow::Result;

/// Durable persistence consumed by the engine and the API layer.
///
/// Writes to the same run are serialized by the implementation; writes
/// to different runs may commit in any order. `list_*` methods never
/// return soft-deleted definition rows.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // === Runs ===

    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn update_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>>;

    /// Runs of one workflow, most recent first. Returns the page and
    /// the total count.
    async fn list_runs(
        &self,
        workflow_id: &WorkflowId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowRun>, usize)>;

    // === Step executions ===

    async fn create_step_execution(&self, exec: &StepExecution) -> Result<()>;

    async fn update_step_execution(&self, exec: &StepExecution) -> Result<()>;

    /// All step executions of a run, ordered by start time
    async fn list_step_executions(&self, run_id: &RunId) -> Result<Vec<StepExecution>>;

    async fn get_step_execution(
        &self,
        run_id: &RunId,
        step_id: &StepId,
    ) -> Result<Option<StepExecution>>;

    // === Step logs ===

    async fn append_step_log(&self, log: &StepLog) -> Result<()>;

    /// Logs of a run in append order, optionally narrowed to one step
    /// and/or one level
    async fn list_step_logs(
        &self,
        run_id: &RunId,
        step_id: Option<&StepId>,
        level: Option<LogLevel>,
    ) -> Result<Vec<StepLog>>;

    // === Variable changes ===

    async fn append_variable_change(&self, change: &VariableChange) -> Result<()>;

    /// Changes of a run in append order, optionally narrowed to one
    /// variable
    async fn list_variable_changes(
        &self,
        run_id: &RunId,
        var_name: Option<&str>,
    ) -> Result<Vec<VariableChange>>;

    // === Workflow definitions ===

    async fn put_workflow(&self, workflow: &Workflow) -> Result<()>;

    async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>>;

    async fn list_workflows(
        &self,
        is_test_case: Option<bool>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Workflow>, usize)>;

    /// Soft delete; returns false when the workflow does not exist
    async fn delete_workflow(&self, workflow_id: &WorkflowId) -> Result<bool>;

    // === Test cases ===

    async fn put_test_case(&self, test_case: &TestCase) -> Result<()>;

    async fn get_test_case(&self, test_id: &TestId) -> Result<Option<TestCase>>;

    async fn list_test_cases(
        &self,
        group_id: Option<&GroupId>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<TestCase>, usize)>;

    /// Soft delete; returns false when the test case does not exist
    async fn delete_test_case(&self, test_id: &TestId) -> Result<bool>;

    // === Test groups ===

    async fn put_test_group(&self, group: &TestGroup) -> Result<()>;

    async fn get_test_group(&self, group_id: &GroupId) -> Result<Option<TestGroup>>;

    async fn list_test_groups(&self) -> Result<Vec<TestGroup>>;

    async fn delete_test_group(&self, group_id: &GroupId) -> Result<bool>;

    // === Test results ===

    async fn append_test_result(&self, result: &TestResult) -> Result<()>;

    /// Results of one test case, most recent first
    async fn list_test_results(
        &self,
        test_id: &TestId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<TestResult>, usize)>;

    // === Environments ===

    async fn put_environment(&self, env: &Environment) -> Result<()>;

    async fn get_environment(&self, env_id: &EnvId) -> Result<Option<Environment>>;

    async fn list_environments(&self) -> Result<Vec<Environment>>;

    /// Soft delete; returns false when the environment does not exist
    async fn delete_environment(&self, env_id: &EnvId) -> Result<bool>;

    /// The unique environment with `is_active = true`, if any
    async fn get_active_environment(&self) -> Result<Option<Environment>>;

    /// Atomically deactivate every environment and activate the given
    /// one. Returns false (and changes nothing) when the target does
    /// not exist.
    async fn set_active_environment(&self, env_id: &EnvId) -> Result<bool>;
}
