/// Human task endpoints

use super::{actor, ApiResult, AppState};
use crate::workflow::types::{CompleteTaskRequest, WorkflowTask};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    /// Only open tasks assigned to this principal
    pub assignee: Option<String>,
}

pub fn create_task_routes() -> Router<AppState> {
    Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/claim", post(claim_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
}

/// GET /api/tasks[?assignee=alice]
async fn list_tasks(State(state): State<AppState>, Query(query): Query<TaskQuery>) -> Json<Vec<WorkflowTask>> {
    let tasks = match query.assignee {
        Some(assignee) => state.engine.get_tasks_by_assignee(&assignee).await,
        None => state.engine.list_workflow_tasks().await,
    };
    Json(tasks)
}

/// GET /api/tasks/{id}
async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkflowTask> {
    Ok(Json(state.engine.get_workflow_task(&id).await?))
}

/// POST /api/tasks/{id}/claim
async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<WorkflowTask> {
    Ok(Json(state.engine.claim_task(&id, &actor(&headers)).await?))
}

/// POST /api/tasks/{id}/complete
/// Body: { "action": "complete" | "reject", "data": {...}, "comment": "..." }
async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CompleteTaskRequest>,
) -> ApiResult<WorkflowTask> {
    let task = state
        .engine
        .complete_workflow_task(&id, request, &actor(&headers))
        .await?;
    Ok(Json(task))
}
