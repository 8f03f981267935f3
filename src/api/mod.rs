/// HTTP API Layer
///
/// Thin axum adapter over the engine's exposed operations. Every handler maps
/// one request onto one engine call and maps `EngineError` onto its suggested
/// HTTP status with a `{code, message}` body.

// Definition listing and hot-reload saves
pub mod definitions;

// Instance start, inspection, progress and termination
pub mod instances;

// Task listing, claiming and completion
pub mod tasks;

use crate::{error::EngineError, runtime::WorkflowEngine, workflow::DefinitionRegistry};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Router,
};
use serde_json::json;
use std::sync::Arc;

/// Header naming the acting principal; no authentication is performed
pub const ACTOR_HEADER: &str = "x-actor";
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    /// Writable side of the definition repository the engine reads from
    pub registry: Arc<DefinitionRegistry>,
}

/// Engine error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("❌ {}", self.0);
        } else {
            tracing::debug!("↩️ {} {}", status, self.0);
        }

        let body = Json(json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Acting principal from the `x-actor` header
pub fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_ACTOR)
        .to_string()
}

/// All engine routes
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(definitions::create_definition_routes())
        .merge(instances::create_instance_routes())
        .merge(tasks::create_task_routes())
}
