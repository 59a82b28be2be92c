#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use interview_sfu::media::config::env_or;
use interview_sfu::media::{MediaConfig, WorkerPool};
use interview_sfu::metrics::ServerMetrics;
use interview_sfu::room::SessionManager;
use interview_sfu::signaling::{ServerSettings, SignalingServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_sfu=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("interview-sfu - Starting server");

    let media_config = MediaConfig::from_env().context("Invalid media configuration")?;
    match &media_config.webrtc_transport_config.announced_address {
        Some(ip) => info!("Announcing {} in ICE candidates", ip),
        None => info!("No ANNOUNCE_IP set, ICE candidates carry the listen address"),
    }

    // Worker start-up failure is fatal
    let pool = Arc::new(
        WorkerPool::new(&media_config)
            .await
            .context("Failed to start mediasoup workers")?,
    );
    info!("Worker pool ready with {} workers", pool.len());

    let metrics = ServerMetrics::new();
    let eviction: bool = env_or("ROOM_EVICTION", true);
    let sessions = SessionManager::new(pool, media_config, metrics.clone(), eviction);

    let signaling_server = SignalingServer::new(sessions.clone(), metrics, ServerSettings::from_env());

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve() => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    sessions.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
