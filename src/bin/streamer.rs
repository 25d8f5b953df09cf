//! AR Streamer Application
//!
//! Streams camera, microphone and AR telemetry over RTSP and advertises the
//! endpoint on the local network.
//!
//! Usage: `ar-streamer [CONFIG.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ar_streamer::{
    ui::{AppState, WebServer},
    AppConfig, Pipeline,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AR Streamer v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Stream: {} @ {}fps, video={} audio={} ar={} depth={}",
        config.stream.resolution_string(),
        config.stream.video.fps,
        config.stream.has_video,
        config.stream.has_audio,
        config.stream.has_ar,
        config.stream.include_depth,
    );

    let mut pipeline = Pipeline::start(config.clone())
        .await
        .context("starting pipeline")?;

    if let Some(url) = pipeline.status().url {
        println!("\n=== Streaming ===");
        println!("  {}", url);
        println!();
    }

    // Start status endpoint
    let ui_cancel = CancellationToken::new();
    let mut ui_task = None;
    if config.ui.enabled {
        let state = AppState {
            status: pipeline.status_handle(),
            tracking: pipeline.tracking_handle(),
            stream: pipeline.stream_config().clone(),
            sdp: pipeline.session_sdp(),
            started: Instant::now(),
        };
        match WebServer::new(config.ui.clone(), state)
            .start_background(ui_cancel.clone())
            .await
        {
            Ok((_, handle)) => ui_task = Some(handle),
            Err(e) => tracing::warn!("Status endpoint disabled: {}", e),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down..."),
        _ = pipeline.closed() => tracing::error!("Pipeline terminated by a fatal error"),
    }

    let faulted = pipeline.is_faulted();
    let last_error = pipeline.status().last_error;
    pipeline.stop().await;

    ui_cancel.cancel();
    if let Some(handle) = ui_task {
        let _ = handle.await;
    }

    if faulted {
        anyhow::bail!(
            "stream aborted: {}",
            last_error.unwrap_or_else(|| "unknown error".into())
        );
    }
    tracing::info!("AR Streamer stopped");
    Ok(())
}
