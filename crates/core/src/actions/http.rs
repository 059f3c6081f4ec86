use super::ActionResult;
use crate::types::{Assertion, AssertionKind, AssertionOp, HttpConfig, JsonMap};
use crate::vars;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Default per-attempt request timeout
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Execute an HTTP action: build the request, read the response in
/// full, and evaluate assertions. A completed exchange only fails when
/// an assertion rejects it; transport errors and timeouts fail outright.
pub(crate) async fn execute(
    client: &reqwest::Client,
    base_url: &str,
    config: HttpConfig,
) -> ActionResult {
    let started = Instant::now();
    let elapsed = |started: Instant| started.elapsed().as_millis() as i64;

    let url = match (&config.url, &config.path) {
        (Some(url), _) => url.clone(),
        (None, Some(path)) => format!("{}{}", base_url, path),
        (None, None) => {
            return ActionResult::failed("http config requires a path or url", 0);
        }
    };

    let method = match reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return ActionResult::failed(format!("invalid http method '{}'", config.method), 0);
        }
    };

    let timeout = Duration::from_secs(config.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let mut request = client.request(method, &url).timeout(timeout);
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), vars::value_to_string(value));
    }
    if let Some(body) = &config.body {
        request = request.json(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            return ActionResult::failed(format!("request failed: {err}"), elapsed(started));
        }
    };

    let status_code = response.status().as_u16();
    let body_raw = match response.text().await {
        Ok(text) => text,
        Err(err) => {
            return ActionResult::failed(
                format!("failed to read response body: {err}"),
                elapsed(started),
            );
        }
    };

    // A non-JSON body is not an error; assertions just see null
    let body: Value = serde_json::from_str(&body_raw).unwrap_or(Value::Null);

    let mut output = JsonMap::new();
    output.insert("statusCode".to_string(), json!(status_code));
    output.insert("body".to_string(), body.clone());
    output.insert("bodyRaw".to_string(), json!(body_raw));

    let failures = evaluate_assertions(&config.assertions, status_code, &body);
    if failures.is_empty() {
        ActionResult::success(output, elapsed(started))
    } else {
        ActionResult::assertion_failures(output, failures, elapsed(started))
    }
}

/// Evaluate the assertion kinds that apply to an HTTP exchange
pub(crate) fn evaluate_assertions(
    assertions: &[Assertion],
    status_code: u16,
    body: &Value,
) -> Vec<String> {
    let mut failures = Vec::new();

    for assertion in assertions {
        match assertion.kind {
            AssertionKind::StatusCode => {
                if let Some(failure) = check_status_code(assertion, status_code) {
                    failures.push(failure);
                }
            }
            AssertionKind::JsonPath => {
                if let Some(failure) = check_json_path(assertion, body) {
                    failures.push(failure);
                }
            }
            // exit_code / stdout_contains do not apply to HTTP
            _ => {}
        }
    }

    failures
}

fn check_status_code(assertion: &Assertion, actual: u16) -> Option<String> {
    let actual_value = json!(actual);
    let expected = assertion.expected.as_ref();

    let accepted = match assertion.operator {
        AssertionOp::In => expected
            .and_then(Value::as_array)
            .map(|candidates| candidates.iter().any(|c| json_values_equal(c, &actual_value)))
            .unwrap_or(false),
        _ => expected
            .map(|e| json_values_equal(e, &actual_value))
            .unwrap_or(false),
    };

    if accepted {
        None
    } else {
        Some(format!(
            "status code: expected {}, got {}",
            expected.map(Value::to_string).unwrap_or_else(|| "?".to_string()),
            actual
        ))
    }
}

fn check_json_path(assertion: &Assertion, body: &Value) -> Option<String> {
    let Some(path) = assertion.path.as_deref() else {
        return Some("json_path assertion is missing a path".to_string());
    };

    let value = lookup_json_path(body, path);

    if assertion.operator == AssertionOp::Exists {
        return match value {
            Some(v) if !v.is_null() => None,
            _ => Some(format!("JSON path {} should exist", path)),
        };
    }

    match (value, assertion.expected.as_ref()) {
        (Some(actual), Some(expected)) if json_values_equal(expected, actual) => None,
        (actual, expected) => Some(format!(
            "JSON path {}: expected {}, got {}",
            path,
            expected.map(Value::to_string).unwrap_or_else(|| "?".to_string()),
            actual.map(Value::to_string).unwrap_or_else(|| "missing".to_string()),
        )),
    }
}

/// Resolve a `$.a.b` path against a JSON body
pub(crate) fn lookup_json_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let mut current = body;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Equality with numeric tolerance: numbers compare by value, so an
/// expected `200` matches an actual `200.0`
pub(crate) fn json_values_equal(expected: &Value, actual: &Value) -> bool {
    if let (Some(lhs), Some(rhs)) = (expected.as_f64(), actual.as_f64()) {
        return lhs == rhs;
    }
    expected == actual
}
