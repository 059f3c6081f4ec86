use super::ActionResult;
use crate::types::{Assertion, AssertionKind, CommandConfig, JsonMap};
use crate::vars;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Default per-attempt subprocess timeout
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Execute a command action: spawn the subprocess, capture stdout and
/// stderr, and evaluate assertions. A non-zero exit fails the action
/// unless an `exit_code` assertion accepts it.
pub(crate) async fn execute(config: CommandConfig) -> ActionResult {
    let started = Instant::now();
    let elapsed = |started: Instant| started.elapsed().as_millis() as i64;

    let mut command = Command::new(&config.cmd);
    command
        .args(config.args.iter().map(vars::value_to_string))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the wait future on timeout kills the child
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return ActionResult::failed(
                format!("failed to spawn '{}': {err}", config.cmd),
                elapsed(started),
            );
        }
    };

    let timeout_secs = config.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return ActionResult::failed(format!("command failed: {err}"), elapsed(started));
        }
        Err(_) => {
            // The command ran and was killed, so this counts as a
            // judged failure rather than a dispatch error
            return ActionResult::assertion_failures(
                JsonMap::new(),
                vec![format!("command timed out after {timeout_secs}s")],
                elapsed(started),
            );
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut result_output = JsonMap::new();
    result_output.insert("exitCode".to_string(), json!(exit_code));
    result_output.insert("stdout".to_string(), json!(&stdout));
    result_output.insert("stderr".to_string(), json!(&stderr));

    let mut failures = evaluate_assertions(&config.assertions, exit_code, &stdout);

    let has_exit_assertion = config
        .assertions
        .iter()
        .any(|a| a.kind == AssertionKind::ExitCode);
    if exit_code != 0 && !has_exit_assertion {
        failures.push(format!("command exited with status {exit_code}"));
    }

    if failures.is_empty() {
        ActionResult::success(result_output, elapsed(started))
    } else {
        ActionResult::assertion_failures(result_output, failures, elapsed(started))
    }
}

/// Evaluate the assertion kinds that apply to a subprocess
pub(crate) fn evaluate_assertions(
    assertions: &[Assertion],
    exit_code: i32,
    stdout: &str,
) -> Vec<String> {
    let mut failures = Vec::new();

    for assertion in assertions {
        match assertion.kind {
            AssertionKind::ExitCode => {
                let matches = assertion
                    .expected
                    .as_ref()
                    .and_then(Value::as_f64)
                    .map(|expected| expected == exit_code as f64)
                    .unwrap_or(false);
                if !matches {
                    failures.push(format!(
                        "exit code: expected {}, got {}",
                        assertion
                            .expected
                            .as_ref()
                            .map(Value::to_string)
                            .unwrap_or_else(|| "?".to_string()),
                        exit_code
                    ));
                }
            }
            AssertionKind::StdoutContains => {
                let contains = assertion
                    .expected
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(|needle| stdout.contains(needle))
                    .unwrap_or(false);
                if !contains {
                    failures.push(format!(
                        "stdout should contain: {}",
                        assertion
                            .expected
                            .as_ref()
                            .map(Value::to_string)
                            .unwrap_or_else(|| "?".to_string())
                    ));
                }
            }
            // status_code / json_path do not apply to subprocesses
            _ => {}
        }
    }

    failures
}
