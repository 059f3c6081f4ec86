pub mod command;
pub mod http;
pub mod test_case;

use crate::broadcast::EventHub;
use crate::definition::{StepDef, StepKind};
use crate::error::EngineError;
use crate::logging::RunLogger;
use crate::store::Store;
use crate::types::{CommandConfig, HttpConfig, JsonMap, TestId, TestResult, TestStatus};
use crate::vars;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Normalized outcome of a single action attempt. Assertion failures
/// and timeouts are carried here as data; the step executor decides
/// whether they become a step-level failure.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub output: JsonMap,
    /// Milliseconds
    pub duration: i64,
    pub error: Option<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Failed,
}

impl ActionResult {
    pub fn success(output: JsonMap, duration: i64) -> Self {
        Self {
            status: ActionStatus::Success,
            output,
            duration,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>, duration: i64) -> Self {
        Self {
            status: ActionStatus::Failed,
            output: JsonMap::new(),
            duration,
            error: Some(error.into()),
            failures: Vec::new(),
        }
    }

    /// The action completed but its assertions did not hold
    pub fn assertion_failures(output: JsonMap, failures: Vec<String>, duration: i64) -> Self {
        Self {
            status: ActionStatus::Failed,
            output,
            duration,
            error: Some(failures.join("; ")),
            failures,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Dispatches a step to one of the three action kinds behind a uniform
/// result. Holds the shared HTTP client and the base URL http actions
/// resolve relative paths against.
pub struct ActionDispatcher {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
}

impl ActionDispatcher {
    pub fn new(store: Arc<dyn Store>, hub: Arc<EventHub>, base_url: impl Into<String>) -> Self {
        Self {
            store,
            hub,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Substitute variables into the step's config and run it
    pub async fn dispatch(
        &self,
        step: &StepDef,
        variables: &JsonMap,
        logger: &RunLogger,
    ) -> ActionResult {
        let config = vars::substitute_map(&step.config, variables);

        match step.kind {
            StepKind::Http => match narrow_config::<HttpConfig>(&config) {
                Ok(http_config) => http::execute(&self.client, &self.base_url, http_config).await,
                Err(err) => ActionResult::failed(format!("invalid http config: {err}"), 0),
            },
            StepKind::Command => match narrow_config::<CommandConfig>(&config) {
                Ok(command_config) => command::execute(command_config).await,
                Err(err) => ActionResult::failed(format!("invalid command config: {err}"), 0),
            },
            StepKind::TestCase => {
                test_case::execute(self, &config, variables, logger, &step.id).await
            }
        }
    }

    /// Execute a stored test case directly, outside any workflow run,
    /// and persist the resulting `TestResult`. Inline variables overlay
    /// the active environment's variables for substitution.
    pub async fn run_test_case(
        &self,
        test_id: &TestId,
        inline_vars: Option<JsonMap>,
    ) -> Result<TestResult, EngineError> {
        let test_case = self
            .store
            .get_test_case(test_id)
            .await?
            .ok_or_else(|| EngineError::not_found("test case", test_id))?;

        let env_vars = match self.store.get_active_environment().await {
            Ok(Some(env)) => env.variables,
            _ => JsonMap::new(),
        };
        let variables =
            vars::merge_layers(env_vars, JsonMap::new(), inline_vars.unwrap_or_default());

        let start_time = chrono::Utc::now();
        let result = test_case::run_loaded(self, &test_case, &variables).await;
        let end_time = chrono::Utc::now();

        // Failures mean the action ran and was judged; a failure with
        // no failure list never got that far (bad config, spawn or
        // transport error)
        let status = if result.is_success() {
            TestStatus::Passed
        } else if !result.failures.is_empty() {
            TestStatus::Failed
        } else {
            TestStatus::Error
        };

        let run_id = result
            .output
            .get("workflowRunId")
            .and_then(Value::as_str)
            .and_then(|id| id.parse().ok());

        let test_result = TestResult {
            test_id: test_id.clone(),
            run_id,
            status,
            start_time,
            end_time,
            duration: (end_time - start_time).num_milliseconds(),
            error: result.error.clone(),
            failures: result.failures.clone(),
            response: if result.output.is_empty() {
                None
            } else {
                Some(Value::Object(result.output))
            },
        };
        self.store.append_test_result(&test_result).await?;
        Ok(test_result)
    }
}

/// Narrow an untyped config tree into the typed form an action expects
pub(crate) fn narrow_config<T: DeserializeOwned>(config: &JsonMap) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(config.clone()))
}
