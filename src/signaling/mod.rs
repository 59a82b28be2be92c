#![forbid(unsafe_code)]

// Signaling module - HTTP surface and WebSocket entry point

pub mod connection;
pub mod protocol;
pub mod session;

use crate::media::config::env_or;
use crate::metrics::ServerMetrics;
use crate::room::SessionManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3004;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Listener settings, read once at start-up
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub max_connections: usize,
    pub metrics_token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            metrics_token: None,
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Self {
        let mut max_connections = env_or("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would refuse every client, using {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        Self {
            port: env_or("PORT", DEFAULT_PORT),
            max_connections,
            metrics_token: std::env::var("METRICS_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    rooms: usize,
    participants: usize,
    worker_load: Vec<usize>,
}

#[derive(Clone)]
pub struct SignalingServer {
    sessions: SessionManager,
    metrics: ServerMetrics,
    slots: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
    port: u16,
}

impl SignalingServer {
    pub fn new(sessions: SessionManager, metrics: ServerMetrics, settings: ServerSettings) -> Self {
        info!("Accepting up to {} concurrent connections", settings.max_connections);
        if settings.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is public");
        }
        Self {
            sessions,
            metrics,
            slots: Arc::new(Semaphore::new(settings.max_connections)),
            metrics_token: settings.metrics_token.map(Arc::from),
            port: settings.port,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds the configured port and serves until the listener fails
    ///
    /// # Errors
    /// Returns an error if the port cannot be bound
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Signaling on ws://{}/ws", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Accepts the request when no token is configured or the bearer token matches
fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        rooms: server.sessions.room_count(),
        participants: server.sessions.participant_count(),
        worker_load: server.sessions.load_distribution(),
    })
}

async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if !authorized(&headers, server.metrics_token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let body = server
        .metrics
        .render_prometheus(server.sessions.room_count(), server.sessions.participant_count());
    ([("content-type", "text/plain; version=0.0.4; charset=utf-8")], body).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let Ok(permit) = server.slots.clone().try_acquire_owned() else {
        warn!("Connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.max_message_size(MAX_FRAME_BYTES)
        .on_failed_upgrade(|error| warn!("WebSocket upgrade failed: {}", error))
        .on_upgrade(move |socket| connection::handle_connection(socket, server.sessions, server.metrics, permit))
}
