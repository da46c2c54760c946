//! HTTP surface and lifecycle: capability endpoint, versioned WebSocket
//! routes, and the listener.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use burrow_core::{ErrorCode, Maintainer, MetaError, ProjectInfo, ProtocolMeta};

use crate::fetch::ResourceFetcher;
use crate::session;

/// Protocol versions this build speaks. Sessions on other versions are
/// refused before the WebSocket handshake completes.
pub const SUPPORTED_VERSIONS: &[u16] = &[1];

const DEFAULT_PORT: u16 = 9690;
const DEFAULT_SEND_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the capability endpoint lives at; version routes hang off it.
    pub prefix: String,
    pub request_timeout: Duration,
    pub max_body_size: u64,
    pub max_packet_size: usize,
    pub maintainer: Option<Maintainer>,
    pub project: ProjectInfo,
    /// Capacity of each session's outbound queue.
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let meta = ProtocolMeta::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            prefix: "/".to_string(),
            request_timeout: meta.request_timeout(),
            max_body_size: meta.max_body_size,
            max_packet_size: meta.max_packet_size,
            maintainer: None,
            project: ProjectInfo::this_crate(),
            max_send_queue: DEFAULT_SEND_QUEUE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared immutable state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub meta: Arc<ProtocolMeta>,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub max_send_queue: usize,
}

/// A running server. The accept loop stops when the handle is dropped.
#[derive(Debug)]
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Bind and serve. Port 0 picks a free port, reported on the handle.
pub async fn start(
    config: ServerConfig,
    fetcher: Arc<dyn ResourceFetcher>,
) -> Result<ServerHandle, StartError> {
    let meta = ProtocolMeta::new(
        SUPPORTED_VERSIONS.to_vec(),
        config.request_timeout,
        config.max_body_size,
        config.max_packet_size,
        config.maintainer,
        config.project,
    )?;
    let state = AppState {
        meta: Arc::new(meta),
        fetcher,
        max_send_queue: config.max_send_queue,
    };
    let router = build_router(&config.prefix, state);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(host = %config.host, port = addr.port(), prefix = %config.prefix, "server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: addr.port(),
        server,
    })
}

/// Capability endpoint at the prefix, one WebSocket route per supported
/// version beneath it, everything else handled by the fallback.
pub fn build_router(prefix: &str, state: AppState) -> Router {
    let prefix = normalize_prefix(prefix);

    let mut router = Router::new().route(&meta_path(&prefix), any(meta_handler));
    if prefix != "/" {
        router = router.route(&prefix, any(meta_handler));
    }

    for &version in &state.meta.versions {
        let handler = move |state: State<AppState>,
                            ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>| {
            ws_entry(version, state, ws)
        };
        let base = format!("{prefix}v{version}");
        router = router
            .route(&base, any(handler))
            .route(&format!("{base}/"), any(handler));
    }

    router
        .fallback(fallback_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Trailing slash guaranteed, so version segments append cleanly.
fn normalize_prefix(prefix: &str) -> String {
    let mut prefix = if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    };
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

fn meta_path(prefix: &str) -> String {
    if prefix == "/" {
        prefix.to_string()
    } else {
        prefix.trim_end_matches('/').to_string()
    }
}

async fn meta_handler(method: Method, State(state): State<AppState>) -> Response {
    if method != Method::GET {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(ErrorCode::MethodNotAllowed.http_body()),
        )
            .into_response();
    }
    Json(state.meta.as_ref().clone()).into_response()
}

async fn ws_entry(
    version: u16,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| session::run(socket, version, state)),
        // Plain HTTP on a version route has nothing to serve.
        Err(_) => not_found(),
    }
}

/// Unmatched paths. An upgrade aimed at an unsupported version gets the
/// closest thing to a silent refusal HTTP allows: an empty response telling
/// the client not to reuse the connection, with no protocol payload.
async fn fallback_handler(ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>) -> Response {
    match ws {
        Ok(_) => (
            StatusCode::NOT_FOUND,
            [(header::CONNECTION, "close")],
        )
            .into_response(),
        Err(_) => not_found(),
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorCode::NotFound.http_body())).into_response()
}
