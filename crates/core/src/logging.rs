use crate::broadcast::{EventHub, EventKind};
use crate::store::Store;
use crate::types::{ChangeType, LogLevel, RunId, StepId, StepLog, VariableChange};
use serde_json::{json, Value};
use std::sync::Arc;

/// Step-scoped logger for one run. Every line is persisted as a
/// `StepLog` row, broadcast as a `step_log` event, and mirrored to
/// tracing. Persistence is best-effort; a failed write never stalls
/// the run.
#[derive(Clone)]
pub struct RunLogger {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    run_id: RunId,
}

impl RunLogger {
    pub fn new(store: Arc<dyn Store>, hub: Arc<EventHub>, run_id: RunId) -> Self {
        Self { store, hub, run_id }
    }

    async fn log(&self, level: LogLevel, step_id: &StepId, message: &str) {
        let entry = StepLog {
            run_id: self.run_id,
            step_id: step_id.clone(),
            level,
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        };

        if let Err(err) = self.store.append_step_log(&entry).await {
            tracing::warn!("failed to persist step log for run {}: {:#}", self.run_id, err);
        }

        self.hub
            .broadcast(
                &self.run_id,
                EventKind::StepLog,
                json!({
                    "stepId": entry.step_id,
                    "level": entry.level,
                    "message": entry.message,
                    "timestamp": entry.timestamp,
                }),
            )
            .await;

        match level {
            LogLevel::Debug => tracing::debug!("step {}: {}", step_id, message),
            LogLevel::Info => tracing::info!("step {}: {}", step_id, message),
            LogLevel::Warn => tracing::warn!("step {}: {}", step_id, message),
            LogLevel::Error => tracing::error!("step {}: {}", step_id, message),
        }
    }

    pub async fn debug(&self, step_id: &StepId, message: &str) {
        self.log(LogLevel::Debug, step_id, message).await;
    }

    pub async fn info(&self, step_id: &StepId, message: &str) {
        self.log(LogLevel::Info, step_id, message).await;
    }

    pub async fn warn(&self, step_id: &StepId, message: &str) {
        self.log(LogLevel::Warn, step_id, message).await;
    }

    pub async fn error(&self, step_id: &StepId, message: &str) {
        self.log(LogLevel::Error, step_id, message).await;
    }
}

/// Records workflow variable mutations for one run. Each change is
/// appended to the store (best-effort) and broadcast as a
/// `variable_change` event.
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    run_id: RunId,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn Store>, hub: Arc<EventHub>, run_id: RunId) -> Self {
        Self { store, hub, run_id }
    }

    pub async fn track(
        &self,
        step_id: &StepId,
        var_name: &str,
        old_value: Option<Value>,
        new_value: Value,
        change_type: ChangeType,
    ) {
        let change = VariableChange {
            run_id: self.run_id,
            step_id: step_id.clone(),
            var_name: var_name.to_string(),
            old_value,
            new_value,
            change_type,
            timestamp: chrono::Utc::now(),
        };

        if let Err(err) = self.store.append_variable_change(&change).await {
            tracing::warn!(
                "failed to persist variable change for run {}: {:#}",
                self.run_id,
                err
            );
        }

        self.hub
            .broadcast(
                &self.run_id,
                EventKind::VariableChange,
                json!({
                    "stepId": change.step_id,
                    "varName": change.var_name,
                    "oldValue": change.old_value,
                    "newValue": change.new_value,
                    "changeType": change.change_type,
                    "timestamp": change.timestamp,
                }),
            )
            .await;
    }
}
