use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use testflow_core::definition::WorkflowDefinition;
use testflow_core::types::{
    Assertion, CommandConfig, EnvId, Environment, GroupId, HttpConfig, JsonMap, LogLevel, RunId,
    StepExecution, StepId, StepLog, TestCase, TestGroup, TestId, TestKind, TestResult,
    VariableChange, Workflow, WorkflowId, WorkflowRun,
};
use std::sync::Arc;

const DEFAULT_PAGE_LIMIT: usize = 20;

/// Paginated list envelope
#[derive(Debug, Serialize)]
pub struct PageResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

fn page<T>(data: Vec<T>, total: usize, limit: usize, offset: usize) -> Json<PageResponse<T>> {
    Json(PageResponse {
        data,
        total,
        limit,
        offset,
    })
}

// === Workflows ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub workflow_id: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub definition: Value,
    #[serde(default)]
    pub is_test_case: bool,
}

pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let workflow_id = WorkflowId::new(
        req.workflow_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );

    // Reject malformed definitions before they are stored
    WorkflowDefinition::parse(&workflow_id, req.definition.clone().into())?;

    let now = chrono::Utc::now();
    let workflow = Workflow {
        workflow_id,
        name: req.name,
        version: req.version,
        description: req.description,
        definition: req.definition,
        is_test_case: req.is_test_case,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    state.store.put_workflow(&workflow).await?;

    Ok((StatusCode::CREATED, Json(workflow)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkflowsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub is_test_case: Option<bool>,
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkflowsQuery>,
) -> ApiResult<Json<PageResponse<Workflow>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let (workflows, total) = state
        .store
        .list_workflows(query.is_test_case, limit, offset)
        .await?;
    Ok(page(workflows, total, limit, offset))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state
        .store
        .get_workflow(&WorkflowId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow '{id}' not found")))?;
    Ok(Json(workflow))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub definition: Option<Value>,
    pub is_test_case: Option<bool>,
}

pub async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> ApiResult<Json<Workflow>> {
    let workflow_id = WorkflowId::new(&id);
    let mut workflow = state
        .store
        .get_workflow(&workflow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow '{id}' not found")))?;

    if let Some(definition) = req.definition {
        WorkflowDefinition::parse(&workflow_id, definition.clone().into())?;
        workflow.definition = definition;
    }
    if let Some(name) = req.name {
        workflow.name = name;
    }
    if let Some(version) = req.version {
        workflow.version = Some(version);
    }
    if let Some(description) = req.description {
        workflow.description = Some(description);
    }
    if let Some(is_test_case) = req.is_test_case {
        workflow.is_test_case = is_test_case;
    }
    workflow.updated_at = chrono::Utc::now();
    state.store.put_workflow(&workflow).await?;

    Ok(Json(workflow))
}

pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_workflow(&WorkflowId::new(&id)).await? {
        return Err(ApiError::not_found(format!("workflow '{id}' not found")));
    }
    Ok(Json(serde_json::json!({"message": "workflow deleted"})))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub variables: Option<JsonMap>,
}

pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteWorkflowRequest>>,
) -> ApiResult<Json<WorkflowRun>> {
    let workflow_id = WorkflowId::new(&id);
    let workflow = state
        .store
        .get_workflow(&workflow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow '{id}' not found")))?;

    let inline_vars = body.and_then(|Json(req)| req.variables);
    let result = state
        .engine
        .execute(&workflow_id, workflow.definition.into(), inline_vars)
        .await?;

    let run = state
        .store
        .get_run(&result.run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run '{}' not found", result.run_id)))?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_workflow_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PaginationQuery>,
) -> ApiResult<Json<PageResponse<WorkflowRun>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let (runs, total) = state
        .store
        .list_runs(&WorkflowId::new(&id), limit, offset)
        .await?;
    Ok(page(runs, total, limit, offset))
}

// === Workflow runs ===

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid run id '{raw}'")))
}

pub async fn get_workflow_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<WorkflowRun>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run '{run_id}' not found")))?;
    Ok(Json(run))
}

pub async fn get_step_executions(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<StepExecution>>> {
    let run_id = parse_run_id(&run_id)?;
    let steps = state.store.list_step_executions(&run_id).await?;
    Ok(Json(steps))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLogsQuery {
    pub step_id: Option<String>,
    pub level: Option<LogLevel>,
}

pub async fn get_step_logs(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<StepLogsQuery>,
) -> ApiResult<Json<Vec<StepLog>>> {
    let run_id = parse_run_id(&run_id)?;
    let step_id = query.step_id.map(StepId::new);
    let logs = state
        .store
        .list_step_logs(&run_id, step_id.as_ref(), query.level)
        .await?;
    Ok(Json(logs))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableChangesQuery {
    pub var_name: Option<String>,
}

pub async fn get_variable_changes(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<VariableChangesQuery>,
) -> ApiResult<Json<Vec<VariableChange>>> {
    let run_id = parse_run_id(&run_id)?;
    let changes = state
        .store
        .list_variable_changes(&run_id, query.var_name.as_deref())
        .await?;
    Ok(Json(changes))
}

// === Test cases ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestCaseRequest {
    pub test_id: Option<String>,
    pub group_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TestKind,
    pub timeout: Option<u64>,
    pub workflow_id: Option<String>,
    pub workflow_def: Option<Value>,
    pub http: Option<HttpConfig>,
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

pub async fn create_test_case(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTestCaseRequest>,
) -> ApiResult<(StatusCode, Json<TestCase>)> {
    let now = chrono::Utc::now();
    let test_case = TestCase {
        test_id: TestId::new(
            req.test_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ),
        group_id: GroupId::new(req.group_id),
        name: req.name,
        kind: req.kind,
        timeout: req.timeout,
        workflow_id: req.workflow_id.map(WorkflowId::new),
        workflow_def: req.workflow_def,
        http: req.http,
        command: req.command,
        assertions: req.assertions,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    state.store.put_test_case(&test_case).await?;

    Ok((StatusCode::CREATED, Json(test_case)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTestCasesQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub group_id: Option<String>,
}

pub async fn list_test_cases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTestCasesQuery>,
) -> ApiResult<Json<PageResponse<TestCase>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let group_id = query.group_id.map(GroupId::new);
    let (tests, total) = state
        .store
        .list_test_cases(group_id.as_ref(), limit, offset)
        .await?;
    Ok(page(tests, total, limit, offset))
}

pub async fn get_test_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TestCase>> {
    let test_case = state
        .store
        .get_test_case(&TestId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("test case '{id}' not found")))?;
    Ok(Json(test_case))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTestCaseRequest {
    pub group_id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<TestKind>,
    pub timeout: Option<u64>,
    pub workflow_id: Option<String>,
    pub workflow_def: Option<Value>,
    pub http: Option<HttpConfig>,
    pub command: Option<CommandConfig>,
    pub assertions: Option<Vec<Assertion>>,
}

pub async fn update_test_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTestCaseRequest>,
) -> ApiResult<Json<TestCase>> {
    let test_id = TestId::new(&id);
    let mut test_case = state
        .store
        .get_test_case(&test_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("test case '{id}' not found")))?;

    if let Some(group_id) = req.group_id {
        test_case.group_id = GroupId::new(group_id);
    }
    if let Some(name) = req.name {
        test_case.name = name;
    }
    if let Some(kind) = req.kind {
        test_case.kind = kind;
    }
    if let Some(timeout) = req.timeout {
        test_case.timeout = Some(timeout);
    }
    if let Some(workflow_id) = req.workflow_id {
        test_case.workflow_id = Some(WorkflowId::new(workflow_id));
    }
    if let Some(workflow_def) = req.workflow_def {
        test_case.workflow_def = Some(workflow_def);
    }
    if let Some(http) = req.http {
        test_case.http = Some(http);
    }
    if let Some(command) = req.command {
        test_case.command = Some(command);
    }
    if let Some(assertions) = req.assertions {
        test_case.assertions = assertions;
    }
    test_case.updated_at = chrono::Utc::now();
    state.store.put_test_case(&test_case).await?;

    Ok(Json(test_case))
}

pub async fn delete_test_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_test_case(&TestId::new(&id)).await? {
        return Err(ApiError::not_found(format!("test case '{id}' not found")));
    }
    Ok(Json(serde_json::json!({"message": "test case deleted"})))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteTestCaseRequest {
    #[serde(default)]
    pub variables: Option<JsonMap>,
}

pub async fn execute_test_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteTestCaseRequest>>,
) -> ApiResult<Json<TestResult>> {
    let inline_vars = body.and_then(|Json(req)| req.variables);
    let result = state
        .dispatcher
        .run_test_case(&TestId::new(&id), inline_vars)
        .await?;
    Ok(Json(result))
}

pub async fn list_test_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PaginationQuery>,
) -> ApiResult<Json<PageResponse<TestResult>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let (results, total) = state
        .store
        .list_test_results(&TestId::new(&id), limit, offset)
        .await?;
    Ok(page(results, total, limit, offset))
}

// === Test groups ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestGroupRequest {
    pub group_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
}

pub async fn create_test_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTestGroupRequest>,
) -> ApiResult<(StatusCode, Json<TestGroup>)> {
    let now = chrono::Utc::now();
    let group = TestGroup {
        group_id: GroupId::new(
            req.group_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ),
        name: req.name,
        description: req.description,
        created_at: now,
        updated_at: now,
    };
    state.store.put_test_group(&group).await?;

    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn list_test_groups(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<TestGroup>>> {
    let groups = state.store.list_test_groups().await?;
    Ok(Json(groups))
}

pub async fn get_test_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TestGroup>> {
    let group = state
        .store
        .get_test_group(&GroupId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("test group '{id}' not found")))?;
    Ok(Json(group))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTestGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

pub async fn update_test_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTestGroupRequest>,
) -> ApiResult<Json<TestGroup>> {
    let group_id = GroupId::new(&id);
    let mut group = state
        .store
        .get_test_group(&group_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("test group '{id}' not found")))?;

    if let Some(name) = req.name {
        group.name = name;
    }
    if let Some(description) = req.description {
        group.description = Some(description);
    }
    group.updated_at = chrono::Utc::now();
    state.store.put_test_group(&group).await?;

    Ok(Json(group))
}

pub async fn delete_test_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_test_group(&GroupId::new(&id)).await? {
        return Err(ApiError::not_found(format!("test group '{id}' not found")));
    }
    Ok(Json(serde_json::json!({"message": "test group deleted"})))
}

pub async fn list_group_tests(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PaginationQuery>,
) -> ApiResult<Json<PageResponse<TestCase>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let group_id = GroupId::new(&id);
    let (tests, total) = state
        .store
        .list_test_cases(Some(&group_id), limit, offset)
        .await?;
    Ok(page(tests, total, limit, offset))
}

// === Environments ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentRequest {
    pub env_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub variables: JsonMap,
}

pub async fn create_environment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateEnvironmentRequest>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    let now = chrono::Utc::now();
    let env = Environment {
        env_id: EnvId::new(
            req.env_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ),
        name: req.name,
        description: req.description,
        is_active: false,
        variables: req.variables,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    state.store.put_environment(&env).await?;

    Ok((StatusCode::CREATED, Json(env)))
}

pub async fn list_environments(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Environment>>> {
    let envs = state.store.list_environments().await?;
    Ok(Json(envs))
}

pub async fn get_active_environment(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Environment>> {
    let env = state
        .store
        .get_active_environment()
        .await?
        .ok_or_else(|| ApiError::not_found("no active environment"))?;
    Ok(Json(env))
}

pub async fn get_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Environment>> {
    let env = state
        .store
        .get_environment(&EnvId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment '{id}' not found")))?;
    Ok(Json(env))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvironmentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub variables: Option<JsonMap>,
}

pub async fn update_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateEnvironmentRequest>,
) -> ApiResult<Json<Environment>> {
    let env_id = EnvId::new(&id);
    let mut env = state
        .store
        .get_environment(&env_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment '{id}' not found")))?;

    if let Some(name) = req.name {
        env.name = name;
    }
    if let Some(description) = req.description {
        env.description = Some(description);
    }
    if let Some(variables) = req.variables {
        env.variables = variables;
    }
    env.updated_at = chrono::Utc::now();
    state.store.put_environment(&env).await?;

    Ok(Json(env))
}

pub async fn delete_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.store.delete_environment(&EnvId::new(&id)).await? {
        return Err(ApiError::not_found(format!("environment '{id}' not found")));
    }
    Ok(Json(serde_json::json!({"message": "environment deleted"})))
}

pub async fn activate_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state
        .store
        .set_active_environment(&EnvId::new(&id))
        .await?
    {
        return Err(ApiError::not_found(format!("environment '{id}' not found")));
    }
    Ok(Json(serde_json::json!({"message": "environment activated"})))
}

pub async fn get_environment_variables(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonMap>> {
    let env = state
        .store
        .get_environment(&EnvId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment '{id}' not found")))?;
    Ok(Json(env.variables))
}

pub async fn get_environment_variable(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let env = state
        .store
        .get_environment(&EnvId::new(&id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment '{id}' not found")))?;
    let value = env
        .variables
        .get(&key)
        .ok_or_else(|| ApiError::not_found(format!("variable '{key}' not found")))?;
    Ok(Json(serde_json::json!({"key": key, "value": value})))
}

#[derive(Debug, Deserialize)]
pub struct SetVariableRequest {
    pub value: Value,
}

pub async fn set_environment_variable(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
    Json(req): Json<SetVariableRequest>,
) -> ApiResult<Json<Value>> {
    let env_id = EnvId::new(&id);
    let mut env = state
        .store
        .get_environment(&env_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment '{id}' not found")))?;

    env.variables.insert(key.clone(), req.value.clone());
    env.updated_at = chrono::Utc::now();
    state.store.put_environment(&env).await?;

    Ok(Json(serde_json::json!({"key": key, "value": req.value})))
}

pub async fn delete_environment_variable(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let env_id = EnvId::new(&id);
    let mut env = state
        .store
        .get_environment(&env_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment '{id}' not found")))?;

    if env.variables.remove(&key).is_none() {
        return Err(ApiError::not_found(format!("variable '{key}' not found")));
    }
    env.updated_at = chrono::Utc::now();
    state.store.put_environment(&env).await?;

    Ok(Json(serde_json::json!({"message": "variable deleted"})))
}
