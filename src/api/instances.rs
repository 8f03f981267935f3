/// Workflow instance endpoints

use super::{actor, ApiError, ApiResult, AppState};
use crate::{
    error::EngineError,
    workflow::types::{StartWorkflowRequest, Variables, WorkflowInstance},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

/// Optional body of cancel/suspend
#[derive(Debug, Default, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/instances", post(start_instance).get(list_instances))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/instances/{id}/nodes/{node_id}/complete", post(progress_instance))
        .route("/api/instances/{id}/cancel", post(cancel_instance))
        .route("/api/instances/{id}/suspend", post(suspend_instance))
}

/// POST /api/instances
/// Body: { "workflowId": "...", "variables": {...}, "businessKey": "...", "priority": "high" }
async fn start_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartWorkflowRequest>,
) -> ApiResult<WorkflowInstance> {
    let initiator = actor(&headers);
    let instance = state.engine.start_workflow(request, &initiator).await?;
    Ok(Json(instance))
}

/// GET /api/instances
async fn list_instances(State(state): State<AppState>) -> Json<Vec<WorkflowInstance>> {
    Json(state.engine.list_workflow_instances().await)
}

/// GET /api/instances/{id}
async fn get_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkflowInstance> {
    Ok(Json(state.engine.get_workflow_instance(&id).await?))
}

/// POST /api/instances/{id}/nodes/{node_id}/complete
/// Body: variables to merge (may be empty)
async fn progress_instance(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<WorkflowInstance> {
    let data: Variables = parse_optional(&body)?;
    let instance = state
        .engine
        .progress_workflow(&id, &node_id, data, &actor(&headers))
        .await?;
    Ok(Json(instance))
}

/// POST /api/instances/{id}/cancel
/// Body (optional): { "reason": "..." }
async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<WorkflowInstance> {
    let request: TerminateRequest = parse_optional(&body)?;
    let instance = state
        .engine
        .cancel_workflow(&id, &actor(&headers), request.reason)
        .await?;
    Ok(Json(instance))
}

/// POST /api/instances/{id}/suspend
/// Body (optional): { "reason": "..." }
async fn suspend_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<WorkflowInstance> {
    let request: TerminateRequest = parse_optional(&body)?;
    let instance = state
        .engine
        .suspend_workflow(&id, &actor(&headers), request.reason)
        .await?;
    Ok(Json(instance))
}

/// An empty body means the default value
fn parse_optional<T: Default + serde::de::DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(body).map_err(|e| {
        tracing::warn!("❌ Invalid JSON body: {}", e);
        ApiError(EngineError::ValidationError(format!("Invalid JSON body: {}", e)))
    })
}
