/// Workflow definition endpoints
///
/// Saving persists the version and hot-reloads it into the registry, so the
/// next start sees it without a restart. Running instances keep the version
/// they were started from.

use super::{ApiError, ApiResult, AppState};
use crate::workflow::types::WorkflowDefinition;
use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;

/// Response for definition saves
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDefinitionResponse {
    pub id: String,
    pub version: u32,
    /// Non-fatal graph findings (cycles, unreachable nodes, missing start)
    pub warnings: Vec<String>,
}

pub fn create_definition_routes() -> Router<AppState> {
    Router::new().route("/api/definitions", get(list_definitions).post(save_definition))
}

/// GET /api/definitions
async fn list_definitions(State(state): State<AppState>) -> Json<Vec<WorkflowDefinition>> {
    let definitions = state
        .engine
        .list_workflow_definitions()
        .iter()
        .map(|definition| (**definition).clone())
        .collect();
    Json(definitions)
}

/// POST /api/definitions
/// Body: a full definition version
async fn save_definition(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<SaveDefinitionResponse> {
    let id = definition.id.clone();
    let version = definition.version;

    let report = state.registry.save(definition).await.map_err(ApiError)?;
    tracing::info!("🔥 Saved definition {} v{} via API", id, version);

    Ok(Json(SaveDefinitionResponse {
        id,
        version,
        warnings: report.warnings,
    }))
}
