//! WebSocket transport server using Axum.
//!
//! Owns its listener and router, so any number of servers can run side
//! by side in one process. Handles admission, the HTTP upgrade, and
//! hands each upgraded socket to the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::rejection::WebSocketUpgradeRejection,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use wshub_core::{ConnectionId, Hooks, Hub, HubError, Payload, RequestMeta, Stats};

use crate::socket::{self, WsSink};

const HEALTH_PATH: &str = "/health";

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Route that accepts WebSocket upgrades
    pub path: String,
    /// Close connections with no inbound message for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// WebSocket read buffer size in bytes
    pub read_buffer_size: usize,
    /// WebSocket write buffer size in bytes
    pub write_buffer_size: usize,
    /// Largest accepted inbound message in bytes
    pub max_message_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            path: "/ws".into(),
            idle_timeout: None,
            enable_cors: false,
            max_connections: None,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_message_size: None,
        }
    }
}

/// Errors starting the transport server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("invalid route path {0:?}: must start with '/' and not be {HEALTH_PATH}")]
    InvalidPath(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state for the HTTP handlers.
struct AppState {
    hub: Arc<Hub<WsSink>>,
    config: TransportConfig,
}

/// The transport server — accepts WebSocket connections into a hub.
pub struct TransportServer {
    hub: Arc<Hub<WsSink>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server with the given hooks.
    pub async fn start<H: Hooks>(config: TransportConfig, hooks: H) -> Result<Self, ServerError> {
        Self::start_with_hooks(config, Arc::new(hooks)).await
    }

    /// Start the transport server with shared hooks.
    pub async fn start_with_hooks(
        config: TransportConfig,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Self, ServerError> {
        if !config.path.starts_with('/') || config.path == HEALTH_PATH {
            return Err(ServerError::InvalidPath(config.path));
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let hub = Hub::with_limit(config.idle_timeout, config.max_connections, hooks);

        let state = Arc::new(AppState {
            hub: hub.clone(),
            config: config.clone(),
        });

        let mut app = Router::new()
            .route(&config.path, get(ws_upgrade_handler))
            .route(HEALTH_PATH, get(health_handler))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        match config.idle_timeout {
            Some(timeout) => info!(
                "wshub listening on ws://{}:{}{} (idle timeout {timeout:?})",
                config.hostname, actual_port, config.path
            ),
            None => info!(
                "wshub listening on ws://{}:{}{} (idle timeout disabled)",
                config.hostname, actual_port, config.path
            ),
        }

        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                error!("HTTP server error: {e}");
            }
        });

        Ok(Self {
            hub,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// The hub holding this server's connections.
    pub fn hub(&self) -> &Arc<Hub<WsSink>> {
        &self.hub
    }

    /// Send a message to one connection.
    pub async fn send(&self, id: ConnectionId, payload: impl Into<Payload>) -> Result<(), HubError> {
        self.hub.send(id, payload).await
    }

    /// Send a message to every open connection.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> usize {
        self.hub.broadcast(payload).await
    }

    /// Close one connection. Returns `false` if it was already closed.
    pub async fn close(&self, id: ConnectionId) -> bool {
        self.hub.close(id).await
    }

    pub fn stats(&self) -> Stats {
        self.hub.stats()
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, close every connection, then wait for the server task.
    ///
    /// Upgrades still in flight when the listener stops are refused by the
    /// hub and their sockets closed.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.hub.shutdown().await;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("wshub transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Fast path for the connection limit; the hub enforces it exactly on accept
    if let Some(max) = state.config.max_connections {
        let current = state.hub.len();
        if current >= max {
            warn!("Connection from {remote_addr} rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let request = request_meta(&uri, &headers, remote_addr);
    if let Err(HubError::AdmissionRejected { code }) = state.hub.admit(&request) {
        return StatusCode::from_u16(code)
            .unwrap_or(StatusCode::FORBIDDEN)
            .into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = HubError::UpgradeFailed(rejection.body_text());
            warn!("Upgrade from {remote_addr} failed: {err}");
            return rejection.into_response();
        }
    };

    let mut ws = ws
        .read_buffer_size(state.config.read_buffer_size)
        .write_buffer_size(state.config.write_buffer_size);
    if let Some(max) = state.config.max_message_size {
        ws = ws.max_message_size(max);
    }

    let hub = state.hub.clone();
    ws.on_failed_upgrade(move |e: axum::Error| {
        warn!("Upgrade from {remote_addr} failed: {}", HubError::UpgradeFailed(e.to_string()));
    })
    .on_upgrade(move |socket| async move {
        let (sink, stream) = socket::split(socket);
        match hub.accept(sink, stream) {
            Ok(id) => debug!("Connection {id} from {remote_addr}"),
            Err(e @ (HubError::ShuttingDown | HubError::AtCapacity { .. })) => {
                warn!("Connection from {remote_addr} dropped after upgrade: {e}")
            }
            Err(e) => error!("Failed to register connection from {remote_addr}: {e}"),
        }
    })
    .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "stats": state.hub.stats(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn request_meta(uri: &Uri, headers: &HeaderMap, remote_addr: SocketAddr) -> RequestMeta {
    RequestMeta {
        path: uri.path().to_owned(),
        query: uri.query().map(str::to_owned),
        remote_addr: Some(remote_addr),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect(),
    }
}
