use super::context::ExecutionContext;
use super::dag;
use super::step_executor::StepExecutor;
use crate::broadcast::{EventHub, EventKind};
use crate::definition::{DefinitionInput, StepKind, WorkflowDefinition};
use crate::error::EngineError;
use crate::logging::{ChangeTracker, RunLogger};
use crate::store::Store;
use crate::types::{
    JsonMap, RunId, RunStatus, StepStatus, TestId, WorkflowId, WorkflowResult, WorkflowRun,
};
use crate::vars;
use chrono::Utc;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Top-level orchestrator: turns a definition into layers, drives them
/// in order with the steps of each layer running concurrently, and
/// finalizes the persisted run.
///
/// The engine is cheap to construct over its shared collaborators, so
/// nested invocation (a test-case step referencing a workflow) simply
/// builds another engine from the same store and hub.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    step_executor: Arc<StepExecutor>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn Store>, hub: Arc<EventHub>, base_url: impl Into<String>) -> Self {
        let step_executor = Arc::new(StepExecutor::new(store.clone(), hub.clone(), base_url));
        Self {
            store,
            hub,
            step_executor,
        }
    }

    /// Execute a workflow to completion.
    ///
    /// Parsing and planning failures short-circuit before any state is
    /// written; no run record exists for a rejected definition.
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        input: DefinitionInput,
        inline_vars: Option<JsonMap>,
    ) -> Result<WorkflowResult, EngineError> {
        let defn = WorkflowDefinition::parse(workflow_id, input)?;
        let layers = dag::plan(&defn)?;
        check_reference_cycles(self.store.clone(), &defn).await?;

        let run_id = RunId::new();
        let start_time = Utc::now();
        tracing::info!("starting workflow execution: workflow={} run={}", workflow_id, run_id);

        let mut run = WorkflowRun {
            run_id,
            workflow_id: workflow_id.clone(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
            duration: None,
            context: None,
            error: None,
        };
        self.store.create_run(&run).await?;

        // Environment variables are the weakest layer; a store failure
        // here degrades to an empty base rather than failing the run
        let env_vars = match self.store.get_active_environment().await {
            Ok(Some(env)) => env.variables,
            Ok(None) => JsonMap::new(),
            Err(err) => {
                tracing::warn!("failed to load active environment: {:#}", err);
                JsonMap::new()
            }
        };
        let variables = vars::merge_layers(
            env_vars,
            defn.variables.clone(),
            inline_vars.unwrap_or_default(),
        );

        let logger = RunLogger::new(self.store.clone(), self.hub.clone(), run_id);
        let tracker = ChangeTracker::new(self.store.clone(), self.hub.clone(), run_id);
        let ctx = Arc::new(ExecutionContext::new(run_id, variables, logger, tracker));

        let mut exec_error: Option<EngineError> = None;
        let mut cancelled = false;
        for layer in &layers {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut tasks = JoinSet::new();
            for step_id in layer {
                let Some(step) = defn.steps.get(step_id) else {
                    continue;
                };
                let step = step.clone();
                let ctx = ctx.clone();
                let step_executor = self.step_executor.clone();
                tasks.spawn(async move { step_executor.execute(&ctx, &step).await });
            }

            // Let the whole layer settle before deciding; a fatal step
            // failure never interrupts its siblings
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if exec_error.is_none() {
                            exec_error = Some(err);
                        }
                    }
                    Err(join_err) => {
                        if exec_error.is_none() {
                            exec_error = Some(EngineError::StepFailed {
                                step_id: String::new(),
                                message: format!("step task aborted: {join_err}"),
                            });
                        }
                    }
                }
            }

            if exec_error.is_some() {
                break;
            }
        }

        let end_time = Utc::now();
        let duration = (end_time - start_time).num_milliseconds();
        run.end_time = Some(end_time);
        run.duration = Some(duration);
        run.status = if cancelled {
            RunStatus::Cancelled
        } else if exec_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        run.error = exec_error.as_ref().map(|err| err.to_string());
        run.context = Some(ctx.snapshot().await);

        // Finalization is a critical write; a store failure here is
        // surfaced, never swallowed
        self.store.update_run(&run).await?;

        self.hub
            .broadcast(
                &run_id,
                EventKind::RunComplete,
                json!({
                    "status": run.status,
                    "duration": duration,
                    "error": run.error.clone(),
                }),
            )
            .await;

        match run.status {
            RunStatus::Success => {
                tracing::info!("workflow execution completed: run={}", run_id);
            }
            _ => {
                tracing::error!(
                    "workflow execution {}: run={} error={}",
                    if cancelled { "cancelled" } else { "failed" },
                    run_id,
                    run.error.as_deref().unwrap_or("unknown")
                );
            }
        }

        let step_results = ctx.step_results().await;
        let completed_steps = step_results
            .values()
            .filter(|outcome| outcome.status == StepStatus::Success)
            .count();
        let failed_steps = step_results
            .values()
            .filter(|outcome| outcome.status == StepStatus::Failed)
            .count();

        Ok(WorkflowResult {
            run_id,
            status: run.status,
            start_time,
            end_time,
            duration,
            total_steps: step_results.len(),
            completed_steps,
            failed_steps,
            step_results,
            context: run.context.clone().unwrap_or(Value::Null),
            error: run.error,
        })
    }
}

/// Reject definitions whose test-case steps transitively reference a
/// workflow already on the reference path. Runs before the run record
/// is created, so a cyclic configuration leaves no trace.
///
/// The walk is best-effort about everything except cycles: unknown test
/// ids and malformed referenced definitions are left for the runtime to
/// report.
async fn check_reference_cycles(
    store: Arc<dyn Store>,
    defn: &WorkflowDefinition,
) -> Result<(), EngineError> {
    walk_references(store, defn.clone(), Vec::new()).await
}

fn walk_references(
    store: Arc<dyn Store>,
    defn: WorkflowDefinition,
    path: Vec<String>,
) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>> {
    Box::pin(async move {
        for step in defn.steps.values() {
            if step.kind != StepKind::TestCase {
                continue;
            }
            let Some(test_id) = step.config.get("testId").and_then(Value::as_str) else {
                continue;
            };

            if path.iter().any(|seen| seen == test_id) {
                return Err(EngineError::CyclicReference {
                    test_id: test_id.to_string(),
                });
            }

            let Ok(Some(test_case)) = store.get_test_case(&TestId::new(test_id)).await else {
                continue;
            };

            let referenced = if let Some(workflow_id) = &test_case.workflow_id {
                match store.get_workflow(workflow_id).await {
                    Ok(Some(workflow)) => {
                        WorkflowDefinition::parse(workflow_id, workflow.definition.into()).ok()
                    }
                    _ => None,
                }
            } else if let Some(definition) = &test_case.workflow_def {
                WorkflowDefinition::parse(
                    &WorkflowId::new(format!("inline-{}", test_case.test_id)),
                    definition.clone().into(),
                )
                .ok()
            } else {
                None
            };

            if let Some(referenced) = referenced {
                let mut sub_path = path.clone();
                sub_path.push(test_id.to_string());
                walk_references(store.clone(), referenced, sub_path).await?;
            }
        }
        Ok(())
    })
}
