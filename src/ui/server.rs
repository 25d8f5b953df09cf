//! Status server

use axum::routing::get;
use axum::Router;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::handlers;
use crate::config::{StreamConfig, UiConfig};
use crate::error::NetworkError;
use crate::rtsp::StatusHandle;
use crate::tracking::TrackingStateHandle;

/// Shared state read by the handlers
pub struct AppState {
    pub status: StatusHandle,
    pub tracking: Option<TrackingStateHandle>,
    pub stream: StreamConfig,
    /// SDP as served over RTSP, absent when the server never bound
    pub sdp: Option<String>,
    pub started: Instant,
}

pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/config", get(handlers::get_stream_config))
            .route("/api/session.sdp", get(handlers::get_session_description))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until `cancel` fires
    pub async fn start_background(
        self,
        cancel: CancellationToken,
    ) -> Result<(SocketAddr, JoinHandle<()>), NetworkError> {
        let ip: IpAddr = self.config.bind_address.parse().map_err(|_| {
            NetworkError::BindFailed(format!("invalid bind address {:?}", self.config.bind_address))
        })?;
        let listener = TcpListener::bind(SocketAddr::new(ip, self.config.http_port))
            .await
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let app = self.router();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::warn!("Status server failed: {}", e);
            }
        });

        tracing::info!("Status endpoint at http://{}/api/status", addr);
        Ok((addr, handle))
    }
}
