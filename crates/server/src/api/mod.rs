use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use testflow_core::error::EngineError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v2/health", get(health_check))
        // Workflow CRUD + execution
        .route("/api/v2/workflows", post(handlers::create_workflow))
        .route("/api/v2/workflows", get(handlers::list_workflows))
        .route("/api/v2/workflows/{id}", get(handlers::get_workflow))
        .route("/api/v2/workflows/{id}", put(handlers::update_workflow))
        .route("/api/v2/workflows/{id}", delete(handlers::delete_workflow))
        .route("/api/v2/workflows/{id}/execute", post(handlers::execute_workflow))
        .route("/api/v2/workflows/{id}/runs", get(handlers::list_workflow_runs))
        // Workflow run details
        .route("/api/v2/workflows/runs/{run_id}", get(handlers::get_workflow_run))
        .route("/api/v2/workflows/runs/{run_id}/steps", get(handlers::get_step_executions))
        .route("/api/v2/workflows/runs/{run_id}/logs", get(handlers::get_step_logs))
        .route("/api/v2/workflows/runs/{run_id}/changes", get(handlers::get_variable_changes))
        // Real-time run stream
        .route("/api/v2/workflows/runs/{run_id}/stream", get(crate::websocket::stream_run))
        // Test case CRUD + execution
        .route("/api/v2/tests", post(handlers::create_test_case))
        .route("/api/v2/tests", get(handlers::list_test_cases))
        .route("/api/v2/tests/{id}", get(handlers::get_test_case))
        .route("/api/v2/tests/{id}", put(handlers::update_test_case))
        .route("/api/v2/tests/{id}", delete(handlers::delete_test_case))
        .route("/api/v2/tests/{id}/execute", post(handlers::execute_test_case))
        .route("/api/v2/tests/{id}/results", get(handlers::list_test_results))
        // Test groups
        .route("/api/v2/groups", post(handlers::create_test_group))
        .route("/api/v2/groups", get(handlers::list_test_groups))
        .route("/api/v2/groups/{id}", get(handlers::get_test_group))
        .route("/api/v2/groups/{id}", put(handlers::update_test_group))
        .route("/api/v2/groups/{id}", delete(handlers::delete_test_group))
        .route("/api/v2/groups/{id}/tests", get(handlers::list_group_tests))
        // Environments
        .route("/api/v2/environments", post(handlers::create_environment))
        .route("/api/v2/environments", get(handlers::list_environments))
        .route("/api/v2/environments/active", get(handlers::get_active_environment))
        .route("/api/v2/environments/{id}", get(handlers::get_environment))
        .route("/api/v2/environments/{id}", put(handlers::update_environment))
        .route("/api/v2/environments/{id}", delete(handlers::delete_environment))
        .route("/api/v2/environments/{id}/activate", post(handlers::activate_environment))
        .route("/api/v2/environments/{id}/variables", get(handlers::get_environment_variables))
        .route("/api/v2/environments/{id}/variables/{key}", get(handlers::get_environment_variable))
        .route("/api/v2/environments/{id}/variables/{key}", put(handlers::set_environment_variable))
        .route("/api/v2/environments/{id}/variables/{key}", delete(handlers::delete_environment_variable))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "testflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error type for API handlers, carrying the HTTP status to answer with
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: anyhow::anyhow!(message.into()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ErrorResponse {
            error: format!("{:#}", self.error),
        };
        (self.status, Json(response)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidDefinition(_)
            | EngineError::MissingDependency { .. }
            | EngineError::CyclicDependency { .. }
            | EngineError::CyclicReference { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: err.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
