use super::{command, http, ActionDispatcher, ActionResult, ActionStatus};
use crate::definition::DefinitionInput;
use crate::error::EngineError;
use crate::logging::RunLogger;
use crate::types::{JsonMap, RunStatus, StepId, TestCase, TestId, TestKind, WorkflowId, WorkflowResult};
use crate::vars;
use crate::workflow::WorkflowEngine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

/// Execute a test-case action: load the referenced test case and either
/// recurse into the workflow engine (when it references a workflow) or
/// dispatch it by its own type.
pub(crate) async fn execute(
    dispatcher: &ActionDispatcher,
    config: &JsonMap,
    variables: &JsonMap,
    logger: &RunLogger,
    step_id: &str,
) -> ActionResult {
    let started = Instant::now();
    let elapsed = |started: Instant| started.elapsed().as_millis() as i64;

    let Some(test_id) = config.get("testId").and_then(Value::as_str) else {
        return ActionResult::failed("testId not specified for test-case step", 0);
    };

    logger
        .info(
            &StepId::new(step_id),
            &format!("executing test case: {test_id}"),
        )
        .await;

    let test_case = match dispatcher.store.get_test_case(&TestId::new(test_id)).await {
        Ok(Some(test_case)) => test_case,
        Ok(None) => {
            return ActionResult::failed(
                format!("test case '{test_id}' not found"),
                elapsed(started),
            );
        }
        Err(err) => {
            return ActionResult::failed(
                format!("failed to load test case '{test_id}': {err:#}"),
                elapsed(started),
            );
        }
    };

    run_loaded(dispatcher, &test_case, variables).await
}

/// Execute an already-loaded test case: recurse into the engine when it
/// references a workflow, otherwise dispatch by its own type. Also the
/// entry point for direct (non-workflow) test execution.
pub(crate) async fn run_loaded(
    dispatcher: &ActionDispatcher,
    test_case: &TestCase,
    variables: &JsonMap,
) -> ActionResult {
    let started = Instant::now();
    let elapsed = |started: Instant| started.elapsed().as_millis() as i64;

    if test_case.workflow_id.is_some() || test_case.workflow_def.is_some() {
        return run_referenced_workflow(dispatcher, test_case, started).await;
    }

    match test_case.kind {
        TestKind::Http => {
            let Some(mut http_config) = test_case.http.clone() else {
                return ActionResult::failed("HTTP configuration missing", elapsed(started));
            };
            http_config.assertions.extend(test_case.assertions.clone());
            if http_config.timeout.is_none() {
                http_config.timeout = test_case.timeout;
            }
            match substitute_config(&http_config, variables) {
                Ok(http_config) => {
                    http::execute(&dispatcher.client, &dispatcher.base_url, http_config).await
                }
                Err(err) => ActionResult::failed(
                    format!("invalid http config after substitution: {err}"),
                    elapsed(started),
                ),
            }
        }
        TestKind::Command => {
            let Some(mut command_config) = test_case.command.clone() else {
                return ActionResult::failed("command configuration missing", elapsed(started));
            };
            command_config.assertions.extend(test_case.assertions.clone());
            if command_config.timeout.is_none() {
                command_config.timeout = test_case.timeout;
            }
            match substitute_config(&command_config, variables) {
                Ok(command_config) => command::execute(command_config).await,
                Err(err) => ActionResult::failed(
                    format!("invalid command config after substitution: {err}"),
                    elapsed(started),
                ),
            }
        }
        TestKind::Workflow => ActionResult::failed(
            "no workflow definition found (missing workflowId or workflowDef)",
            elapsed(started),
        ),
    }
}

/// Re-enter the workflow engine for a test case that references a
/// workflow, producing a nested run.
fn run_referenced_workflow<'a>(
    dispatcher: &'a ActionDispatcher,
    test_case: &'a TestCase,
    started: Instant,
) -> Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>> {
    Box::pin(run_referenced_workflow_inner(dispatcher, test_case, started))
}

async fn run_referenced_workflow_inner(
    dispatcher: &ActionDispatcher,
    test_case: &TestCase,
    started: Instant,
) -> ActionResult {
    let elapsed = |started: Instant| started.elapsed().as_millis() as i64;

    let (workflow_id, input): (WorkflowId, DefinitionInput) =
        if let Some(workflow_id) = &test_case.workflow_id {
            let workflow = match dispatcher.store.get_workflow(workflow_id).await {
                Ok(Some(workflow)) => workflow,
                Ok(None) => {
                    return ActionResult::failed(
                        format!("workflow '{workflow_id}' not found"),
                        elapsed(started),
                    );
                }
                Err(err) => {
                    return ActionResult::failed(
                        format!("failed to load workflow '{workflow_id}': {err:#}"),
                        elapsed(started),
                    );
                }
            };
            (workflow_id.clone(), workflow.definition.into())
        } else if let Some(definition) = &test_case.workflow_def {
            (
                WorkflowId::new(format!("inline-{}", test_case.test_id)),
                definition.clone().into(),
            )
        } else {
            return ActionResult::failed(
                "no workflow definition found (missing workflowId or workflowDef)",
                elapsed(started),
            );
        };

    let engine = WorkflowEngine::new(
        dispatcher.store.clone(),
        dispatcher.hub.clone(),
        dispatcher.base_url.clone(),
    );

    // Boxed through a trait object so the nested engine call does not
    // make this future's type recursive
    let nested: Pin<Box<dyn Future<Output = Result<WorkflowResult, EngineError>> + Send>> =
        Box::pin(async move { engine.execute(&workflow_id, input, None).await });

    match nested.await {
        Ok(result) => {
            let mut output = JsonMap::new();
            output.insert("workflowRunId".to_string(), json!(result.run_id));
            output.insert("totalSteps".to_string(), json!(result.total_steps));
            output.insert("completedSteps".to_string(), json!(result.completed_steps));
            output.insert("failedSteps".to_string(), json!(result.failed_steps));
            output.insert("context".to_string(), result.context.clone());

            if result.status == RunStatus::Success {
                ActionResult::success(output, elapsed(started))
            } else {
                // The workflow ran to a terminal state, so this is a
                // judged failure, not a dispatch error
                let message = result
                    .error
                    .unwrap_or_else(|| "workflow failed".to_string());
                ActionResult {
                    status: ActionStatus::Failed,
                    output,
                    duration: elapsed(started),
                    error: Some(message.clone()),
                    failures: vec![message],
                }
            }
        }
        Err(err) => ActionResult::failed(
            format!("workflow execution failed: {err}"),
            elapsed(started),
        ),
    }
}

/// Substitute variables through a typed config by way of its JSON form
fn substitute_config<T: Serialize + DeserializeOwned>(
    config: &T,
    variables: &JsonMap,
) -> Result<T, serde_json::Error> {
    let value = serde_json::to_value(config)?;
    serde_json::from_value(vars::substitute_value(&value, variables))
}
