use crate::logging::{ChangeTracker, RunLogger};
use crate::types::{ChangeType, JsonMap, RunId, StepId, StepOutcome};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-run mutable state shared by the step tasks of a layer.
///
/// Variables, step outputs, and step results are guarded by a single
/// lock so readers always observe a consistent snapshot. The context is
/// owned by exactly one engine drive; nested runs get their own.
pub struct ExecutionContext {
    pub run_id: RunId,
    pub logger: RunLogger,
    pub tracker: ChangeTracker,
    /// Reserved cancellation hook; checked before each layer and attempt
    pub cancel: CancellationToken,
    state: RwLock<ContextState>,
}

#[derive(Default)]
struct ContextState {
    variables: JsonMap,
    step_outputs: JsonMap,
    step_results: HashMap<String, StepOutcome>,
}

impl ExecutionContext {
    pub fn new(
        run_id: RunId,
        variables: JsonMap,
        logger: RunLogger,
        tracker: ChangeTracker,
    ) -> Self {
        Self {
            run_id,
            logger,
            tracker,
            cancel: CancellationToken::new(),
            state: RwLock::new(ContextState {
                variables,
                ..Default::default()
            }),
        }
    }

    /// Consistent snapshot of the current variables
    pub async fn variables(&self) -> JsonMap {
        self.state.read().await.variables.clone()
    }

    /// Retain a successful step's full output for later steps
    pub async fn record_output(&self, step_id: &StepId, output: JsonMap) {
        let mut state = self.state.write().await;
        state
            .step_outputs
            .insert(step_id.to_string(), Value::Object(output));
    }

    /// Lift mapped output keys into workflow variables, recording one
    /// change per written variable (`create` when previously unbound).
    /// Keys absent from the output are silently skipped.
    pub async fn apply_output_mapping(
        &self,
        step_id: &StepId,
        mapping: &HashMap<String, String>,
        output: &JsonMap,
    ) {
        let mut changes = Vec::new();
        {
            let mut state = self.state.write().await;
            for (var_name, output_key) in mapping {
                let Some(value) = output.get(output_key) else {
                    continue;
                };
                let old_value = state.variables.get(var_name).cloned();
                state.variables.insert(var_name.clone(), value.clone());
                let change_type = if old_value.is_some() {
                    ChangeType::Update
                } else {
                    ChangeType::Create
                };
                changes.push((var_name.clone(), old_value, value.clone(), change_type));
            }
        }

        for (var_name, old_value, new_value, change_type) in changes {
            self.tracker
                .track(step_id, &var_name, old_value, new_value, change_type)
                .await;
        }
    }

    pub async fn record_result(&self, step_id: &StepId, outcome: StepOutcome) {
        let mut state = self.state.write().await;
        state.step_results.insert(step_id.to_string(), outcome);
    }

    pub async fn step_results(&self) -> HashMap<String, StepOutcome> {
        self.state.read().await.step_results.clone()
    }

    /// The run's context as persisted on finalization
    pub async fn snapshot(&self) -> Value {
        let state = self.state.read().await;
        json!({
            "variables": &state.variables,
            "outputs": &state.step_outputs,
        })
    }
}
