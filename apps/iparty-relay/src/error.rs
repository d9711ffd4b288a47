use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub const TUNNEL_NOT_CONNECTED_BODY: &str = "Unity HTTP tunnel not connected";
pub const TUNNEL_CLOSED_BODY: &str = "Unity HTTP tunnel closed";
pub const TIMEOUT_BODY: &str = "Timeout waiting for Unity";

/// Terminal failures of a bridged HTTP request, as seen by the external caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no live HTTP tunnel for host")]
    NotConnected,
    #[error("HTTP tunnel closed before the host answered")]
    TunnelClosed,
    #[error("host did not answer before the deadline")]
    Timeout,
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::NotConnected | BridgeError::TunnelClosed => StatusCode::BAD_GATEWAY,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            BridgeError::NotConnected => TUNNEL_NOT_CONNECTED_BODY,
            BridgeError::TunnelClosed => TUNNEL_CLOSED_BODY,
            BridgeError::Timeout => TIMEOUT_BODY,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            BridgeError::NotConnected => "not_connected",
            BridgeError::TunnelClosed => "tunnel_closed",
            BridgeError::Timeout => "timeout",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.body(),
        )
            .into_response()
    }
}

/// Upgrade attempts the relay refuses before any WebSocket exists.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("path does not name a tunnel endpoint")]
    UnknownPath,
    #[error("no live WS tunnel for host")]
    WsTunnelNotConnected,
}

impl UpgradeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            UpgradeError::UnknownPath => "unknown_path",
            UpgradeError::WsTunnelNotConnected => "ws_tunnel_not_connected",
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let status = match self {
            UpgradeError::UnknownPath => StatusCode::NOT_FOUND,
            UpgradeError::WsTunnelNotConnected => StatusCode::SERVICE_UNAVAILABLE,
        };
        // No body: the caller only learns that the handshake failed.
        (status, [(header::CONNECTION, "close")]).into_response()
    }
}
