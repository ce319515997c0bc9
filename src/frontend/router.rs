//! HTTP router and server loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{any, delete, get},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::auth::require_admin;
use super::connection::ConnectionConfig;
use super::handlers::{api_info, health, list_processes, list_sessions, stop_process};
use super::websocket::ws_handler;
use crate::error::KnobooError;
use crate::session::SessionManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub connection: ConnectionConfig,
    /// Trust `X-Forwarded-For` for client addresses.
    pub proxy: bool,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            connection: ConnectionConfig::default(),
            proxy: false,
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_proxy(mut self, proxy: bool) -> Self {
        self.proxy = proxy;
        self
    }
}

/// Build the router with every route mounted at `/`.
pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/processes", get(list_processes))
        .route("/processes/{id}", delete(stop_process))
        .route("/sessions", get(list_sessions))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let api_v1 = Router::new().route("/", get(api_info)).merge(admin);

    Router::new()
        .route("/health", get(health))
        .route("/ws", any(ws_handler))
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Build the router, nested under `url_root` when it is not `/`.
pub fn create_router_at(state: AppState, url_root: &str) -> Router {
    let root = normalize_root(url_root);
    let router = create_router(state);
    match root {
        Some(root) => Router::new().nest(&root, router),
        None => router,
    }
}

/// `None` for the site root, otherwise `/prefix` without a trailing slash.
fn normalize_root(url_root: &str) -> Option<String> {
    let trimmed = url_root.trim().trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{}", trimmed))
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Running behind a reverse proxy.
    pub proxy: bool,
    /// Path prefix the proxy forwards.
    pub url_root: String,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            proxy: false,
            url_root: "/".to_string(),
        }
    }
}

/// Serve the web front-end until `cancel` fires.
pub async fn serve(
    config: ServerConfig,
    state: AppState,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let addr = config.bind_address();
    let router = create_router_at(state.with_proxy(config.proxy), &config.url_root);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(KnobooError::Io)?;
    tracing::info!(proxy = config.proxy, url_root = %config.url_root, "Starting knoboo front-end on {}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .map_err(|e| KnobooError::Io(std::io::Error::other(e.to_string())))?;

    tracing::info!("front-end stopped");
    Ok(())
}
