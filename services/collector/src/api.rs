//! Status HTTP surface: cached state, metrics and health

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use errors::HomewattError;
use homewatt_state::StateCache;
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::metrics::CollectorMetrics;

#[derive(Clone)]
pub struct ApiState {
    pub cache: StateCache,
    pub metrics: Arc<CollectorMetrics>,
}

/// `HomewattError` as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub HomewattError);

impl From<HomewattError> for ApiError {
    fn from(err: HomewattError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = self.0.error_code(), "API request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/state", get(all_state))
        .route("/api/v1/state/{module}", get(module_state))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn all_state(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let mut modules = Map::new();
    for (name, cached) in state.cache.snapshot() {
        let record: Value = serde_json::from_slice(&cached.payload)
            .map_err(|e| HomewattError::Serialization(format!("state of {}: {}", name, e)))?;
        modules.insert(name, record);
    }
    Ok(Json(Value::Object(modules)))
}

async fn module_state(State(state): State<ApiState>, Path(module): Path<String>) -> Response {
    match state.cache.get(&module) {
        Some(payload) => ([(header::CONTENT_TYPE, "application/json")], payload).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("data for module \"{}\" not found", module),
        )
            .into_response(),
    }
}

async fn metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
