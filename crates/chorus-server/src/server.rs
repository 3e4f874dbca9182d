//! HTTP surface: WebSocket upgrade, `/health`, static assets, and server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backplane::Backplane;
use crate::client;
use crate::config::ServerConfig;
use crate::health;
use crate::hub::HubHandle;

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub backplane: Arc<dyn Backplane>,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(hub: HubHandle, backplane: Arc<dyn Backplane>, config: ServerConfig) -> Self {
        Self {
            hub,
            backplane,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}

/// Build the router: upgrade endpoint, health, and static files for the rest.
pub fn build_router(state: AppState) -> Router {
    let assets = ServeDir::new(&state.config.public_dir);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback_service(assets)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, serve in the background, and return a handle that stops the server.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(state.config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone().cancelled_owned();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
        {
            warn!(error = %e, "server error");
        }
    });

    info!(%addr, "chorus server started");
    Ok(ServerHandle {
        addr,
        shutdown,
        task,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for the listener to close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "server task failed");
        }
        info!("chorus server stopped");
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    name: Option<String>,
}

async fn ws_handler(
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let name = match params.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => return (StatusCode::BAD_REQUEST, "missing name").into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let keepalive = state.config.keepalive();
    let send_buffer = state.config.send_buffer;
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            client::serve(
                socket,
                name,
                state.hub,
                state.backplane,
                keepalive,
                send_buffer,
            )
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats().await;
    Json(health::health_check(state.start_time, stats))
}
