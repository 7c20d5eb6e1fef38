use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use scribe_engine::SessionDriver;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Include `tool_call` frames in chat streams.
    pub forward_tool_events: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            forward_tool_events: true,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<SessionDriver>,
    pub forward_tool_events: bool,
}

impl AppState {
    pub fn new(driver: Arc<SessionDriver>, config: &ServerConfig) -> Self {
        Self {
            driver,
            forward_tool_events: config.forward_tool_events,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(handlers::chat))
        .route("/threads", get(handlers::threads))
        .route("/threads/{thread_id}/messages", get(handlers::messages))
        .route("/threads/{thread_id}/resume", post(handlers::resume))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn start(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    tracing::info!(%addr, "scribe server started");

    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    Ok(ServerHandle { addr, join })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub join: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
