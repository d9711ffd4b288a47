use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    bridge::{self, ExternalRequest},
    config::RelayConfig,
    error::UpgradeError,
    mux,
    registry::{HostSnapshot, TunnelRegistry},
    route::{classify_request, classify_upgrade, UpgradeRoute},
    tunnel,
};

pub struct AppState {
    pub registry: TunnelRegistry,
    pub request_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    hosts: usize,
    http_tunnels: usize,
    ws_tunnels: usize,
    pending_requests: usize,
    external_clients: usize,
    entries: Vec<HostSnapshot>,
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A bound, not yet serving relay.
pub struct RelayServer {
    listener: TcpListener,
    router: Router,
    registry: TunnelRegistry,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig, metrics: Option<PrometheusHandle>) -> Result<Self> {
        let registry = TunnelRegistry::new();
        let state = Arc::new(AppState {
            registry: registry.clone(),
            request_timeout: config.request_timeout,
            metrics,
        });
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;
        Ok(Self {
            listener,
            router: router(state, config.max_body_bytes),
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn registry(&self) -> TunnelRegistry {
        self.registry.clone()
    }

    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("server shutdown with error")
    }
}

pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let server = RelayServer::bind(&config, metrics).await?;
    info!(
        listen_addr = %server.local_addr()?,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        "iparty-relay listening"
    );

    server.serve(shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries = state.registry.snapshot();
    Json(StatsResponse {
        hosts: entries.len(),
        http_tunnels: entries.iter().filter(|e| e.http_connected).count(),
        ws_tunnels: entries.iter().filter(|e| e.ws_connected).count(),
        pending_requests: entries.iter().map(|e| e.pending_requests).sum(),
        external_clients: entries.iter().map(|e| e.external_clients).sum(),
        entries,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Every path outside the fixed endpoints lands here. Upgrades and plain
/// requests are classified separately.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();

    if let Some(ws) = ws {
        return match classify_upgrade(path) {
            Some(UpgradeRoute::RegisterTunnel { host_id, kind }) => {
                let registry = state.registry.clone();
                let host_id = host_id.to_string();
                ws.on_upgrade(move |socket| {
                    tunnel::serve_host_tunnel(socket, registry, host_id, kind)
                })
            }
            Some(UpgradeRoute::ExternalClient { host_id }) => {
                mux::accept(host_id, state.registry.get(host_id), ws)
            }
            None => {
                warn!(path = %path, "upgrade on unknown path rejected");
                let rejection = UpgradeError::UnknownPath;
                counter!(
                    "iparty_relay_upgrades_rejected_total",
                    1,
                    "reason" => rejection.metric_label()
                );
                rejection.into_response()
            }
        };
    }

    let Some(route) = classify_request(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let host = state.registry.get(route.host_id);
    let request = ExternalRequest::new(method, route.target, &headers, body);
    bridge::handle_external(host, request, state.request_timeout).await
}
