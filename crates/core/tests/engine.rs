use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use testflow_core::actions::ActionDispatcher;
use testflow_core::broadcast::{EventHub, EventKind};
use testflow_core::definition::StepDef;
use testflow_core::error::EngineError;
use testflow_core::logging::{ChangeTracker, RunLogger};
use testflow_core::storage::RedbStore;
use testflow_core::store::Store;
use testflow_core::types::{
    ChangeType, CommandConfig, EnvId, Environment, GroupId, JsonMap, LogLevel, RunId, RunStatus,
    StepStatus, TestCase, TestId, TestKind, TestStatus, Workflow, WorkflowId,
};
use testflow_core::workflow::{ExecutionContext, StepExecutor, WorkflowEngine};

fn setup() -> (TempDir, Arc<dyn Store>, Arc<EventHub>, WorkflowEngine) {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn Store> =
        Arc::new(RedbStore::new(temp_dir.path().join("testflow.redb")).unwrap());
    let hub = Arc::new(EventHub::new());
    let engine = WorkflowEngine::new(store.clone(), hub.clone(), "http://localhost:0");
    (temp_dir, store, hub, engine)
}

fn echo_step(args: &[&str], deps: &[&str]) -> Value {
    json!({
        "type": "command",
        "config": {"cmd": "echo", "args": args},
        "dependsOn": deps,
    })
}

fn vars(value: Value) -> JsonMap {
    value.as_object().unwrap().clone()
}

fn environment(id: &str, variables: Value) -> Environment {
    Environment {
        env_id: EnvId::new(id),
        name: id.to_string(),
        description: None,
        is_active: false,
        variables: vars(variables),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    }
}

#[tokio::test]
async fn test_linear_workflow_runs_in_order() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("linear");

    let result = engine
        .execute(
            &workflow_id,
            json!({"name": "linear", "steps": {
                "a": echo_step(&["first"], &[]),
                "b": echo_step(&["second"], &["a"]),
                "c": echo_step(&["third"], &["b"]),
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.completed_steps, 3);
    assert_eq!(result.failed_steps, 0);

    let run = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.end_time.is_some());

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs.len(), 3);
    assert_eq!(execs[0].step_id.0, "a");
    assert_eq!(execs[1].step_id.0, "b");
    assert_eq!(execs[2].step_id.0, "c");
    assert!(execs.iter().all(|e| e.status == StepStatus::Success));

    // Layer barriers: a settles before b starts, b before c
    assert!(execs[0].end_time.unwrap() <= execs[1].start_time);
    assert!(execs[1].end_time.unwrap() <= execs[2].start_time);
}

#[tokio::test]
async fn test_parallel_fan_out() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("parallel");

    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "a": echo_step(&["a"], &[]),
                "b": echo_step(&["b"], &[]),
                "c": echo_step(&["c"], &[]),
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.total_steps, 3);

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs.len(), 3);
}

#[tokio::test]
async fn test_cycle_creates_no_run() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("cyclic");

    let err = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "a": echo_step(&[], &["c"]),
                "b": echo_step(&[], &["a"]),
                "c": echo_step(&[], &["b"]),
            }})
            .into(),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CyclicDependency { .. }));

    let (_, total) = store.list_runs(&workflow_id, 20, 0).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_invalid_definition_creates_no_run() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("broken");

    let err = engine
        .execute(&workflow_id, "not even json".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(_)));

    let (_, total) = store.list_runs(&workflow_id, 20, 0).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_retry_exhaustion() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("retry");

    let started = Instant::now();
    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "flaky": {
                    "type": "command",
                    "config": {"cmd": "/does/not/exist"},
                    "retry": {"maxAttempts": 3, "interval": 100},
                }
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    // Two inter-attempt sleeps of 100ms each
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_steps, 1);

    let run = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());

    let exec = store
        .get_step_execution(&result.run_id, &testflow_core::types::StepId::new("flaky"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, StepStatus::Failed);
}

#[tokio::test]
async fn test_on_error_continue_keeps_run_green() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("continue");

    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "a": {
                    "type": "command",
                    "config": {"cmd": "/does/not/exist"},
                    "onError": "continue",
                },
                "b": echo_step(&["still running"], &["a"]),
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.completed_steps, 1);
    assert_eq!(result.failed_steps, 1);

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    let a = execs.iter().find(|e| e.step_id.0 == "a").unwrap();
    let b = execs.iter().find(|e| e.step_id.0 == "b").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(b.status, StepStatus::Success);
}

#[tokio::test]
async fn test_fatal_failure_stops_later_layers() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("abort");

    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "a": {"type": "command", "config": {"cmd": "/does/not/exist"}},
                "b": echo_step(&["never"], &["a"]),
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].step_id.0, "a");
}

#[tokio::test]
async fn test_variable_priority_inline_over_workflow_over_env() {
    let (_dir, store, _hub, engine) = setup();

    store
        .put_environment(&environment("dev", json!({"X": "env"})))
        .await
        .unwrap();
    store
        .set_active_environment(&EnvId::new("dev"))
        .await
        .unwrap();

    let defn_with_wf_var = json!({
        "variables": {"X": "wf"},
        "steps": {"say": echo_step(&["{{X}}"], &[])},
    });
    let defn_without_wf_var = json!({
        "steps": {"say": echo_step(&["{{X}}"], &[])},
    });

    let stdout_of = |store: Arc<dyn Store>, run_id: RunId| async move {
        let execs = store.list_step_executions(&run_id).await.unwrap();
        execs[0].output_data.as_ref().unwrap()["stdout"]
            .as_str()
            .unwrap()
            .to_string()
    };

    // Inline beats workflow beats environment
    let result = engine
        .execute(
            &WorkflowId::new("prio-inline"),
            defn_with_wf_var.clone().into(),
            Some(vars(json!({"X": "inline"}))),
        )
        .await
        .unwrap();
    assert!(stdout_of(store.clone(), result.run_id).await.contains("inline"));

    let result = engine
        .execute(&WorkflowId::new("prio-wf"), defn_with_wf_var.into(), None)
        .await
        .unwrap();
    assert!(stdout_of(store.clone(), result.run_id).await.contains("wf"));

    let result = engine
        .execute(&WorkflowId::new("prio-env"), defn_without_wf_var.into(), None)
        .await
        .unwrap();
    assert!(stdout_of(store.clone(), result.run_id).await.contains("env"));
}

#[tokio::test]
async fn test_output_mapping_flows_to_later_layer() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("mapping");

    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "produce": {
                    "type": "command",
                    "config": {"cmd": "echo", "args": ["fresh-value"]},
                    "output": {"GREETING": "stdout"},
                },
                "consume": {
                    "type": "command",
                    "config": {"cmd": "echo", "args": ["got: {{GREETING}}"]},
                    "dependsOn": ["produce"],
                },
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    let consume = execs.iter().find(|e| e.step_id.0 == "consume").unwrap();
    let stdout = consume.output_data.as_ref().unwrap()["stdout"].as_str().unwrap();
    assert!(stdout.contains("fresh-value"));

    // The write was recorded as a creation (GREETING was unbound)
    let changes = store
        .list_variable_changes(&result.run_id, Some("GREETING"))
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Create);
    assert!(changes[0].old_value.is_none());
}

#[tokio::test]
async fn test_output_mapping_update_records_old_value() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("mapping-update");

    let result = engine
        .execute(
            &workflow_id,
            json!({
                "variables": {"TOKEN": "stale"},
                "steps": {
                    "refresh": {
                        "type": "command",
                        "config": {"cmd": "echo", "args": ["minted"]},
                        "output": {"TOKEN": "stdout"},
                    },
                },
            })
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);

    let changes = store
        .list_variable_changes(&result.run_id, Some("TOKEN"))
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Update);
    // The old value is what the variable held before the step ran
    assert_eq!(changes[0].old_value, Some(json!("stale")));
}

#[tokio::test]
async fn test_false_condition_skips_without_record() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("conditional");

    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "gated": {
                    "type": "command",
                    "config": {"cmd": "echo", "args": ["never"]},
                    "when": "{{ENABLED}}",
                },
                "always": echo_step(&["yes"], &[]),
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);

    // No StepExecution row for the skipped step, only a log line
    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].step_id.0, "always");

    let logs = store
        .list_step_logs(
            &result.run_id,
            Some(&testflow_core::types::StepId::new("gated")),
            Some(LogLevel::Info),
        )
        .await
        .unwrap();
    assert!(logs.iter().any(|log| log.message.contains("skipped due to condition")));
}

#[tokio::test]
async fn test_true_condition_runs_step() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("conditional-on");

    let result = engine
        .execute(
            &workflow_id,
            json!({
                "variables": {"ENABLED": true},
                "steps": {
                    "gated": {
                        "type": "command",
                        "config": {"cmd": "echo", "args": ["ran"]},
                        "when": "{{ENABLED}}",
                    },
                },
            })
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, StepStatus::Success);
}

#[tokio::test]
async fn test_step_events_are_ordered() {
    let (_dir, store, hub, _engine) = setup();

    let run_id = RunId::new();
    let logger = RunLogger::new(store.clone(), hub.clone(), run_id);
    let tracker = ChangeTracker::new(store.clone(), hub.clone(), run_id);
    let ctx = ExecutionContext::new(run_id, JsonMap::new(), logger, tracker);

    let mut subscription = hub.subscribe(&run_id).await;

    let step: StepDef = serde_json::from_value(json!({
        "id": "s",
        "name": "s",
        "type": "command",
        "config": {"cmd": "echo", "args": ["hi"]},
    }))
    .unwrap();

    StepExecutor::new(store.clone(), hub.clone(), "http://localhost:0")
        .execute(&ctx, &step)
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = subscription.receiver.try_recv() {
        kinds.push(event.kind);
    }

    let start_pos = kinds.iter().position(|k| *k == EventKind::StepStart).unwrap();
    let complete_pos = kinds.iter().position(|k| *k == EventKind::StepComplete).unwrap();
    assert!(start_pos < complete_pos);

    // The entry record was persisted before step_start was broadcast,
    // so a subscriber that sees step_start can already read the row
    let exec = store
        .get_step_execution(&run_id, &testflow_core::types::StepId::new("s"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, StepStatus::Success);
}

fn stored_workflow(id: &str, definition: Value) -> Workflow {
    Workflow {
        workflow_id: WorkflowId::new(id),
        name: id.to_string(),
        version: None,
        description: None,
        definition,
        is_test_case: false,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    }
}

fn workflow_test_case(id: &str, workflow_id: &str) -> TestCase {
    TestCase {
        test_id: TestId::new(id),
        group_id: GroupId::new("g"),
        name: id.to_string(),
        kind: TestKind::Workflow,
        timeout: None,
        workflow_id: Some(WorkflowId::new(workflow_id)),
        workflow_def: None,
        http: None,
        command: None,
        assertions: Vec::new(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    }
}

#[tokio::test]
async fn test_test_case_step_recurses_into_nested_run() {
    let (_dir, store, _hub, engine) = setup();

    store
        .put_workflow(&stored_workflow(
            "child",
            json!({"steps": {"inner": echo_step(&["from child"], &[])}}),
        ))
        .await
        .unwrap();
    store
        .put_test_case(&workflow_test_case("tc-child", "child"))
        .await
        .unwrap();

    let result = engine
        .execute(
            &WorkflowId::new("parent"),
            json!({"steps": {
                "delegate": {
                    "type": "test-case",
                    "config": {"testId": "tc-child"},
                },
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);

    // The nested engine invocation persisted its own run
    let (_, nested_total) = store
        .list_runs(&WorkflowId::new("child"), 20, 0)
        .await
        .unwrap();
    assert_eq!(nested_total, 1);

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    let delegate = execs.iter().find(|e| e.step_id.0 == "delegate").unwrap();
    assert_eq!(delegate.status, StepStatus::Success);
    let output = delegate.output_data.as_ref().unwrap();
    assert_eq!(output["totalSteps"], json!(1));
}

#[tokio::test]
async fn test_cyclic_test_case_reference_is_rejected() {
    let (_dir, store, _hub, engine) = setup();

    let looping_defn = json!({"steps": {
        "loop": {"type": "test-case", "config": {"testId": "tc-loop"}},
    }});
    store
        .put_workflow(&stored_workflow("looping", looping_defn.clone()))
        .await
        .unwrap();
    store
        .put_test_case(&workflow_test_case("tc-loop", "looping"))
        .await
        .unwrap();

    let err = engine
        .execute(&WorkflowId::new("looping"), looping_defn.into(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CyclicReference { test_id } if test_id == "tc-loop"));

    let (_, total) = store.list_runs(&WorkflowId::new("looping"), 20, 0).await.unwrap();
    assert_eq!(total, 0);
}

fn command_test_case(id: &str, config: CommandConfig) -> TestCase {
    TestCase {
        test_id: TestId::new(id),
        group_id: GroupId::new("g"),
        name: id.to_string(),
        kind: TestKind::Command,
        timeout: None,
        workflow_id: None,
        workflow_def: None,
        http: None,
        command: Some(config),
        assertions: Vec::new(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    }
}

fn command_config(cmd: &str, args: &[&str], timeout: Option<u64>) -> CommandConfig {
    CommandConfig {
        cmd: cmd.to_string(),
        args: args.iter().map(|a| json!(a)).collect(),
        cwd: None,
        timeout,
        assertions: Vec::new(),
    }
}

#[tokio::test]
async fn test_direct_execution_distinguishes_failed_from_error() {
    let (_dir, store, hub, _engine) = setup();
    let dispatcher = ActionDispatcher::new(store.clone(), hub.clone(), "http://localhost:0");

    store
        .put_test_case(&command_test_case(
            "tc-ok",
            command_config("echo", &["fine"], None),
        ))
        .await
        .unwrap();
    store
        .put_test_case(&command_test_case(
            "tc-slow",
            command_config("sleep", &["30"], Some(1)),
        ))
        .await
        .unwrap();
    store
        .put_test_case(&command_test_case(
            "tc-ghost",
            command_config("/does/not/exist", &[], None),
        ))
        .await
        .unwrap();

    let result = dispatcher
        .run_test_case(&TestId::new("tc-ok"), None)
        .await
        .unwrap();
    assert_eq!(result.status, TestStatus::Passed);

    // A timeout ran and was judged: failed, with the failure recorded
    let result = dispatcher
        .run_test_case(&TestId::new("tc-slow"), None)
        .await
        .unwrap();
    assert_eq!(result.status, TestStatus::Failed);
    assert!(result.failures[0].contains("timed out"));

    // A command that never spawned is an error, not a failure
    let result = dispatcher
        .run_test_case(&TestId::new("tc-ghost"), None)
        .await
        .unwrap();
    assert_eq!(result.status, TestStatus::Error);
    assert!(result.failures.is_empty());
    assert!(result.error.as_ref().unwrap().contains("failed to spawn"));

    // Every execution persisted a result row
    let (results, total) = store
        .list_test_results(&TestId::new("tc-slow"), 20, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(results[0].status, TestStatus::Failed);
}

#[tokio::test]
async fn test_missing_test_case_fails_step() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("dangling");

    let result = engine
        .execute(
            &workflow_id,
            json!({"steps": {
                "phantom": {"type": "test-case", "config": {"testId": "no-such-test"}},
            }})
            .into(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);

    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs[0].status, StepStatus::Failed);
    assert!(execs[0].error.as_ref().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_run_context_snapshot_is_persisted() {
    let (_dir, store, _hub, engine) = setup();
    let workflow_id = WorkflowId::new("snapshot");

    let result = engine
        .execute(
            &workflow_id,
            json!({
                "variables": {"BASE": 1},
                "steps": {
                    "emit": {
                        "type": "command",
                        "config": {"cmd": "echo", "args": ["v"]},
                        "output": {"EMITTED": "stdout"},
                    },
                },
            })
            .into(),
            None,
        )
        .await
        .unwrap();

    let run = store.get_run(&result.run_id).await.unwrap().unwrap();
    let context = run.context.unwrap();
    assert_eq!(context["variables"]["BASE"], json!(1));
    assert!(context["variables"]["EMITTED"].as_str().unwrap().contains('v'));
    assert!(context["outputs"]["emit"]["stdout"].is_string());
}
