use super::context::ExecutionContext;
use crate::actions::{ActionDispatcher, ActionResult};
use crate::broadcast::{EventHub, EventKind};
use crate::definition::{OnError, StepDef};
use crate::error::EngineError;
use crate::store::Store;
use crate::types::{StepExecution, StepId, StepOutcome, StepStatus};
use crate::vars::Condition;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Runs a single step: condition check, dispatch with retry, execution
/// record persistence, output mapping, and event emission.
///
/// Within one step the side effects are ordered: entry persist, start
/// broadcast, attempts, exit persist, complete broadcast. A
/// subscriber always sees `step_start` before `step_complete`.
pub struct StepExecutor {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    dispatcher: ActionDispatcher,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn Store>, hub: Arc<EventHub>, base_url: impl Into<String>) -> Self {
        let dispatcher = ActionDispatcher::new(store.clone(), hub.clone(), base_url);
        Self {
            store,
            hub,
            dispatcher,
        }
    }

    /// Returns Err only for a fatal failure (`onError = abort`); a step
    /// that fails with `onError = continue` resolves Ok.
    pub async fn execute(&self, ctx: &ExecutionContext, step: &StepDef) -> Result<(), EngineError> {
        let step_id = StepId::new(&step.id);

        if let Some(expr) = &step.when {
            let satisfied = match Condition::parse(expr) {
                Some(condition) => condition.evaluate(&ctx.variables().await),
                None => false,
            };
            if !satisfied {
                ctx.logger
                    .info(&step_id, &format!("step skipped due to condition: {expr}"))
                    .await;
                return Ok(());
            }
        }

        ctx.logger
            .info(&step_id, &format!("starting step: {}", step.name))
            .await;

        let start_time = Utc::now();
        let mut exec = StepExecution {
            run_id: ctx.run_id,
            step_id: step_id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Running,
            start_time,
            end_time: None,
            duration: None,
            input_data: Some(json!({"input": &step.input, "config": &step.config})),
            output_data: None,
            error: None,
        };
        self.store.create_step_execution(&exec).await?;

        self.hub
            .broadcast(
                &ctx.run_id,
                EventKind::StepStart,
                json!({"stepId": &step_id, "stepName": &step.name}),
            )
            .await;

        let result = self.dispatch_with_retry(ctx, step, &step_id).await;

        let end_time = Utc::now();
        let duration = (end_time - start_time).num_milliseconds();
        exec.end_time = Some(end_time);
        exec.duration = Some(duration);

        if !result.is_success() {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "action failed".to_string());
            exec.status = StepStatus::Failed;
            exec.error = Some(message.clone());
            self.store.update_step_execution(&exec).await?;

            ctx.record_result(
                &step_id,
                StepOutcome {
                    status: StepStatus::Failed,
                    duration,
                    output: None,
                    error: Some(message.clone()),
                },
            )
            .await;

            self.hub
                .broadcast(
                    &ctx.run_id,
                    EventKind::StepComplete,
                    json!({
                        "stepId": &step_id,
                        "stepName": &step.name,
                        "status": StepStatus::Failed,
                        "duration": duration,
                        "error": &message,
                    }),
                )
                .await;

            if step.on_error == OnError::Continue {
                ctx.logger
                    .warn(&step_id, "step failed but continuing due to onError=continue")
                    .await;
                return Ok(());
            }
            return Err(EngineError::StepFailed {
                step_id: step.id.clone(),
                message,
            });
        }

        exec.status = StepStatus::Success;
        exec.output_data = Some(Value::Object(result.output.clone()));
        self.store.update_step_execution(&exec).await?;

        ctx.record_output(&step_id, result.output.clone()).await;
        if let Some(mapping) = &step.output {
            ctx.apply_output_mapping(&step_id, mapping, &result.output)
                .await;
        }
        ctx.record_result(
            &step_id,
            StepOutcome {
                status: StepStatus::Success,
                duration,
                output: Some(result.output.clone()),
                error: None,
            },
        )
        .await;

        self.hub
            .broadcast(
                &ctx.run_id,
                EventKind::StepComplete,
                json!({
                    "stepId": &step_id,
                    "stepName": &step.name,
                    "status": StepStatus::Success,
                    "duration": duration,
                }),
            )
            .await;

        ctx.logger
            .info(&step_id, &format!("step completed in {duration}ms"))
            .await;
        Ok(())
    }

    /// Attempt the action up to `retry.maxAttempts` times, sleeping
    /// `retry.interval` milliseconds between attempts
    async fn dispatch_with_retry(
        &self,
        ctx: &ExecutionContext,
        step: &StepDef,
        step_id: &StepId,
    ) -> ActionResult {
        let max_attempts = step
            .retry
            .as_ref()
            .map(|retry| retry.max_attempts.max(1))
            .unwrap_or(1);
        let interval_ms = step.retry.as_ref().map(|retry| retry.interval_ms).unwrap_or(0);

        let mut result = None;
        for attempt in 1..=max_attempts {
            if ctx.cancel.is_cancelled() {
                return ActionResult::failed("run cancelled", 0);
            }

            let variables = ctx.variables().await;
            let attempt_result = self.dispatcher.dispatch(step, &variables, &ctx.logger).await;
            let succeeded = attempt_result.is_success();
            result = Some(attempt_result);
            if succeeded {
                break;
            }

            if attempt < max_attempts {
                ctx.logger
                    .warn(step_id, &format!("attempt {attempt} failed, retrying"))
                    .await;
                if interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }

        result.unwrap_or_else(|| ActionResult::failed("step was never attempted", 0))
    }
}
