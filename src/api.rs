use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::coordination::StreamStateManager;
use crate::errors::{RestartError, StartError, StopError};
use crate::AppState;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiResponse::<()>::error(message, status.as_u16()))).into_response()
}

pub fn start_error_status(e: &StartError) -> StatusCode {
    match e {
        StartError::AlreadyRunning(_) => StatusCode::OK,
        StartError::NoFreeSlot { .. } | StartError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        StartError::DirectoryNotWritable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        StartError::Disabled(_) => StatusCode::FORBIDDEN,
        StartError::InvalidName(_) => StatusCode::BAD_REQUEST,
    }
}

fn start_result_response(name: &str, result: Result<crate::lifecycle::ContextHandle, StartError>) -> Response {
    match result {
        Ok(handle) => Json(ApiResponse::success(serde_json::json!({
            "stream": name,
            "handle": handle,
            "already_running": false
        })))
        .into_response(),
        Err(StartError::AlreadyRunning(_)) => Json(ApiResponse::success(serde_json::json!({
            "stream": name,
            "already_running": true
        })))
        .into_response(),
        Err(e) => error_response(start_error_status(&e), &e.to_string()),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/streams", get(api_list_streams))
        .route("/api/streams/:name", get(api_get_stream))
        .route("/api/streams/:name/start", post(api_start_stream))
        .route("/api/streams/:name/stop", post(api_stop_stream))
        .route("/api/streams/:name/restart", post(api_restart_stream))
        .route("/api/streams/:name/disable", post(api_disable_stream))
        .route("/api/streams/:name/enable", post(api_enable_stream))
        .with_state(state)
}

async fn api_list_streams(State(state): State<AppState>) -> Response {
    Json(ApiResponse::success(state.registry.list())).into_response()
}

async fn api_get_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.status(&name) {
        Some(status) => Json(ApiResponse::success(status)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Stream not found"),
    }
}

async fn api_start_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StreamConfig>>,
) -> Response {
    let config = match body.map(|Json(config)| config).or_else(|| state.registry.config_for(&name)) {
        Some(config) => config,
        None => return error_response(StatusCode::NOT_FOUND, "No configuration known for stream"),
    };
    if config.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "URL is required");
    }

    info!("API start requested for stream '{}'", name);
    let result = state.registry.start(&name, config).await;
    start_result_response(&name, result)
}

async fn api_stop_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    info!("API stop requested for stream '{}'", name);
    match state.registry.stop(&name).await {
        Ok(()) => Json(ApiResponse::success(serde_json::json!({ "stream": name, "stopped": true }))).into_response(),
        Err(StopError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "Stream not found"),
    }
}

async fn api_restart_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    info!("API restart requested for stream '{}'", name);
    match state.registry.restart(&name).await {
        Ok(handle) => Json(ApiResponse::success(serde_json::json!({
            "stream": name,
            "handle": handle
        })))
        .into_response(),
        Err(RestartError::Stop(StopError::NotFound(_))) => error_response(StatusCode::NOT_FOUND, "Stream not found"),
        Err(RestartError::Start(e)) => {
            warn!("Restart of stream '{}' failed to start: {}", name, e);
            start_result_response(&name, Err(e))
        }
    }
}

async fn api_disable_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    state.states.set_disabled(&name, true);
    let stopped = state.registry.stop(&name).await.is_ok();
    Json(ApiResponse::success(serde_json::json!({
        "stream": name,
        "disabled": true,
        "stopped": stopped
    })))
    .into_response()
}

async fn api_enable_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    state.states.set_disabled(&name, false);
    match state.registry.config_for(&name) {
        Some(config) => {
            let result = state.registry.start(&name, config).await;
            start_result_response(&name, result)
        }
        None => Json(ApiResponse::success(serde_json::json!({
            "stream": name,
            "disabled": false,
            "started": false
        })))
        .into_response(),
    }
}

async fn api_health(State(state): State<AppState>) -> Response {
    let streams = state.registry.list();
    let active = streams.iter().filter(|s| s.running && s.connection_valid).count();
    let disabled: Vec<&str> = streams
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| state.states.is_stream_disabled(name))
        .collect();

    Json(ApiResponse::success(serde_json::json!({
        "shutting_down": state.registry.is_shutting_down(),
        "streams": streams.len(),
        "active": active,
        "capacity": state.registry.capacity(),
        "disabled": disabled,
        "tracker": state.registry.tracker().stats(),
        "watchdog": state.watchdog.stats(),
        "running_components": state.coordinator.running_components(),
    })))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_start_error_status_codes() {
        assert_eq!(start_error_status(&StartError::AlreadyRunning("a".into())), StatusCode::OK);
        assert_eq!(
            start_error_status(&StartError::NoFreeSlot { capacity: 4 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            start_error_status(&StartError::DirectoryNotWritable {
                path: PathBuf::from("/hls/a"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(start_error_status(&StartError::Disabled("a".into())), StatusCode::FORBIDDEN);
        assert_eq!(start_error_status(&StartError::InvalidName("a/b".into())), StatusCode::BAD_REQUEST);
        assert_eq!(start_error_status(&StartError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_envelope_shape() {
        let body = serde_json::to_value(ApiResponse::<()>::error("Stream not found", 404)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "status": "error", "error": "Stream not found", "code": 404 })
        );
        let body = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(body, serde_json::json!({ "status": "success", "data": [1, 2] }));
    }
}
