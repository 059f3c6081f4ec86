use crate::types::JsonMap;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder regex"));

/// Right-biased union of the three variable layers, weakest first:
/// active environment ← workflow definition ← inline execution.
pub fn merge_layers(env_vars: JsonMap, workflow_vars: JsonMap, inline_vars: JsonMap) -> JsonMap {
    let mut merged = env_vars;
    for (key, value) in workflow_vars {
        merged.insert(key, value);
    }
    for (key, value) in inline_vars {
        merged.insert(key, value);
    }
    merged
}

/// Recursively substitute `{{NAME}}` placeholders in a JSON value.
/// Strings are rewritten; maps and sequences are traversed; every other
/// leaf is returned unchanged. Pure; the inputs are not mutated.
pub fn substitute_value(value: &Value, vars: &JsonMap) -> Value {
    match value {
        Value::String(s) => substitute_string(s, vars),
        Value::Object(map) => Value::Object(substitute_map(map, vars)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, vars)).collect())
        }
        other => other.clone(),
    }
}

/// Substitute placeholders across every entry of a JSON object
pub fn substitute_map(map: &JsonMap, vars: &JsonMap) -> JsonMap {
    map.iter()
        .map(|(key, value)| (key.clone(), substitute_value(value, vars)))
        .collect()
}

/// Substitute placeholders in a single string.
///
/// A string that is exactly one placeholder resolves to the bound value
/// with its type preserved (unbound names leave the string unchanged).
/// A string with surrounding text or several placeholders resolves
/// textually; unbound placeholders stay literal.
fn substitute_string(s: &str, vars: &JsonMap) -> Value {
    let mut matches = PLACEHOLDER_RE.find_iter(s).peekable();
    if matches.peek().is_none() {
        return Value::String(s.to_string());
    }

    // Whole-string placeholder: return the raw value, type intact
    if let Some(caps) = PLACEHOLDER_RE.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            let name = &caps[1];
            return match vars.get(name) {
                Some(value) => value.clone(),
                None => Value::String(s.to_string()),
            };
        }
    }

    let result = PLACEHOLDER_RE.replace_all(s, |caps: &regex::Captures<'_>| {
        match vars.get(&caps[1]) {
            Some(value) => value_to_string(value),
            // Leave unbound placeholders literal
            None => caps[0].to_string(),
        }
    });
    Value::String(result.into_owned())
}

/// Render a variable value for embedding in a larger string: strings
/// verbatim, integers decimal, floats shortest round-trip, booleans
/// `true`/`false`, everything else canonical JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Truthiness of a resolved condition value: null is false, booleans
/// are themselves, numbers are true unless zero, strings are true
/// unless empty or `"false"`, containers are true unless empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// A step condition: exactly one `{{VAR}}` placeholder, tested for
/// truthiness against the variables at the time the step is scheduled.
#[derive(Debug, Clone)]
pub struct Condition {
    pub var_name: String,
}

impl Condition {
    /// Parse a condition expression; anything other than a lone
    /// placeholder is rejected.
    pub fn parse(expr: &str) -> Option<Self> {
        let caps = PLACEHOLDER_RE.captures(expr.trim())?;
        if caps.get(0).map(|m| m.as_str()) != Some(expr.trim()) {
            return None;
        }
        Some(Self {
            var_name: caps[1].to_string(),
        })
    }

    /// An unbound variable evaluates to false
    pub fn evaluate(&self, vars: &JsonMap) -> bool {
        vars.get(&self.var_name).map(is_truthy).unwrap_or(false)
    }
}
