//! Scoring server handlers

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::scoring::Scorer;

/// Shared by every request
pub struct ServeState {
    pub scorer: Scorer,
    pub model_uuid: Option<String>,
    /// Bounds concurrent scoring processes
    pub workers: Semaphore,
}

impl ServeState {
    pub fn new(scorer: Scorer, model_uuid: Option<String>, workers: usize) -> Self {
        Self {
            scorer,
            model_uuid,
            workers: Semaphore::new(workers.max(1)),
        }
    }
}

fn error_response(status: StatusCode, error_code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error_code": error_code, "message": message.into() })),
    )
        .into_response()
}

/// Liveness probe
pub async fn ping() -> StatusCode {
    StatusCode::OK
}

pub async fn health_check(State(state): State<Arc<ServeState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "model_uuid": state.model_uuid,
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// Score a JSON request body
pub async fn invocations(
    State(state): State<Arc<ServeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if !content_type.starts_with("application/json") {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                format!("Content type '{}' is not supported, use application/json", content_type),
            );
        }
    }

    let input: Value = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(e) => {
            tracing::debug!("Rejected invalid request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                format!("Invalid JSON input: {}", e),
            );
        }
    };

    let _permit = match state.workers.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", e.to_string())
        }
    };

    let scorer = state.scorer.clone();
    let outcome = tokio::task::spawn_blocking(move || scorer.score(&input)).await;

    match outcome {
        Ok(Ok(predictions)) => Json(json!({ "predictions": predictions })).into_response(),
        Ok(Err(e)) => {
            tracing::error!("Scoring failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
        }
        Err(e) => {
            tracing::error!("Scoring task panicked: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
        }
    }
}
