use crate::error::EngineError;
use crate::types::{JsonMap, WorkflowId};
use crate::vars::Condition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of action a workflow step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Http,
    Command,
    TestCase,
}

/// What to do when a step exhausts its retries and still fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Abort,
    Continue,
}

/// Retry policy for a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Sleep between attempts, in milliseconds
    #[serde(rename = "interval")]
    pub interval_ms: u64,
}

/// A single step of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    /// Normalized to the step's key in `WorkflowDefinition::steps`
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonMap>,
    /// Maps a workflow variable name to a key of this step's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<HashMap<String, String>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Condition expression; a single `{{VAR}}` placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_error: OnError,
}

/// A parsed, validated workflow definition. Immutable for the duration
/// of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub variables: JsonMap,
    pub steps: HashMap<String, StepDef>,
}

/// The formats a definition may arrive in: a JSON value (stored blob or
/// request body) or raw JSON text.
#[derive(Debug, Clone)]
pub enum DefinitionInput {
    Value(Value),
    Json(String),
}

impl From<Value> for DefinitionInput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<String> for DefinitionInput {
    fn from(text: String) -> Self {
        Self::Json(text)
    }
}

impl From<&str> for DefinitionInput {
    fn from(text: &str) -> Self {
        Self::Json(text.to_string())
    }
}

impl WorkflowDefinition {
    /// Parse and validate a definition. Falls back to the workflow id
    /// for a missing name.
    pub fn parse(workflow_id: &WorkflowId, input: DefinitionInput) -> Result<Self, EngineError> {
        let value = match input {
            DefinitionInput::Value(v) => v,
            DefinitionInput::Json(text) => serde_json::from_str(&text)
                .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?,
        };

        if !value.is_object() {
            return Err(EngineError::InvalidDefinition(
                "definition must be a JSON object".to_string(),
            ));
        }

        let mut defn: WorkflowDefinition = serde_json::from_value(value)
            .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;

        if defn.name.is_empty() {
            defn.name = workflow_id.to_string();
        }

        defn.normalize()?;
        Ok(defn)
    }

    /// Align step ids with their map keys and check per-step shape
    fn normalize(&mut self) -> Result<(), EngineError> {
        for (key, step) in self.steps.iter_mut() {
            step.id = key.clone();
            if step.name.is_empty() {
                step.name = key.clone();
            }

            if let Some(retry) = &step.retry {
                if retry.max_attempts < 1 {
                    return Err(EngineError::InvalidDefinition(format!(
                        "step '{}': retry.maxAttempts must be at least 1",
                        key
                    )));
                }
            }

            if let Some(expr) = &step.when {
                if Condition::parse(expr).is_none() {
                    return Err(EngineError::InvalidDefinition(format!(
                        "step '{}': condition must be a single {{{{VAR}}}} placeholder, got '{}'",
                        key, expr
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wf_id() -> WorkflowId {
        WorkflowId::new("wf-1")
    }

    #[test]
    fn test_parse_from_value() {
        let defn = WorkflowDefinition::parse(
            &wf_id(),
            json!({
                "name": "deploy",
                "variables": {"ENV": "staging"},
                "steps": {
                    "build": {
                        "name": "Build",
                        "type": "command",
                        "config": {"cmd": "make"}
                    }
                }
            })
            .into(),
        )
        .unwrap();

        assert_eq!(defn.name, "deploy");
        assert_eq!(defn.steps["build"].id, "build");
        assert_eq!(defn.steps["build"].kind, StepKind::Command);
        assert_eq!(defn.steps["build"].on_error, OnError::Abort);
    }

    #[test]
    fn test_parse_from_json_string() {
        let text = r#"{"steps": {"s": {"type": "http", "config": {"method": "GET", "path": "/"}}}}"#;
        let defn = WorkflowDefinition::parse(&wf_id(), text.into()).unwrap();

        // Missing name falls back to the workflow id; missing step name
        // falls back to the step key.
        assert_eq!(defn.name, "wf-1");
        assert_eq!(defn.steps["s"].name, "s");
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let err = WorkflowDefinition::parse(&wf_id(), json!([1, 2, 3]).into()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_step_type() {
        let err = WorkflowDefinition::parse(
            &wf_id(),
            json!({"steps": {"s": {"type": "ftp", "config": {}}}}).into(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }

    #[test]
    fn test_parse_rejects_zero_max_attempts() {
        let err = WorkflowDefinition::parse(
            &wf_id(),
            json!({"steps": {"s": {
                "type": "command",
                "config": {"cmd": "true"},
                "retry": {"maxAttempts": 0, "interval": 100}
            }}})
            .into(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }

    #[test]
    fn test_parse_rejects_compound_condition() {
        let err = WorkflowDefinition::parse(
            &wf_id(),
            json!({"steps": {"s": {
                "type": "command",
                "config": {"cmd": "true"},
                "when": "{{A}} && {{B}}"
            }}})
            .into(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }
}
