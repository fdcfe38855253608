use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use recall_engine::Orchestrator;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Large enough that oversized content items reach request validation.
    pub max_body_bytes: usize,
    /// Time allowed to produce response headers. Streams are not cut once open.
    pub request_timeout: Duration,
    /// Callers granted the assistant capability.
    pub assistant_user_ids: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            max_body_bytes: 64 * 1024 * 1024,
            request_timeout: Duration::from_secs(300),
            assistant_user_ids: Vec::new(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub assistant_users: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &ServerConfig) -> Self {
        Self {
            orchestrator,
            assistant_users: Arc::new(config.assistant_user_ids.iter().cloned().collect()),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/prompt", post(handlers::prompt))
        .route("/api/prompt/stream", post(handlers::prompt_stream))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle that stops the server when asked.
pub async fn start(config: ServerConfig, orchestrator: Arc<Orchestrator>) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState::new(orchestrator, &config), &config);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "Recall server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}
