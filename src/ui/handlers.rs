//! HTTP API handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::config::{StreamConfig, StreamMode};
use crate::rtsp::ServerStatus;
use crate::tracking::TrackingState;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Session status
#[derive(serde::Serialize)]
pub struct SystemStatus {
    #[serde(flatten)]
    pub server: ServerStatus,
    pub mode: StreamMode,
    pub resolution: String,
    pub tracking: TrackingState,
    pub uptime_seconds: u64,
}

/// Get session status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let status = SystemStatus {
        server: state.status.get(),
        mode: state.stream.mode,
        resolution: state.stream.resolution_string(),
        tracking: state
            .tracking
            .as_ref()
            .map_or(TrackingState::NotTracking, |t| t.get()),
        uptime_seconds: state.started.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Get the stream configuration
pub async fn get_stream_config(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StreamConfig>> {
    Json(ApiResponse::ok(state.stream.clone()))
}

/// Get the SDP clients receive on DESCRIBE
pub async fn get_session_description(State(state): State<Arc<AppState>>) -> Response {
    match &state.sdp {
        Some(sdp) => ([(header::CONTENT_TYPE, "application/sdp")], sdp.clone()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::error("stream server is not running")),
        )
            .into_response(),
    }
}
