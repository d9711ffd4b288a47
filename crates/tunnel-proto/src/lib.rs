//! Wire frames exchanged between the relay and a host over its two tunnel
//! connections. Every frame is a single JSON text message; payload bytes are
//! carried base64-encoded so the relay never has to interpret them.
//!
//! Keeping the shapes in their own crate lets the relay, the echo host and the
//! integration tests agree on them without pulling in the server runtime.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Path prefix hosts use when opening a tunnel: `/unity/{host_id}/{kind}`.
pub const REGISTRATION_PREFIX: &str = "unity";
/// Path prefix external callers use: `/host/{host_id}/http/*` and `/host/{host_id}/ws`.
pub const EXTERNAL_PREFIX: &str = "host";

/// Which of the two host tunnels a connection fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Http,
    Ws,
}

impl TunnelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelKind::Http => "http",
            TunnelKind::Ws => "ws",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelKind {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TunnelKind::Http),
            "ws" => Ok(TunnelKind::Ws),
            other => Err(FrameError::UnknownTunnelKind(other.to_string())),
        }
    }
}

/// Path a host upgrades on to register one of its tunnels.
pub fn registration_path(host_id: &str, kind: TunnelKind) -> String {
    format!("/{REGISTRATION_PREFIX}/{host_id}/{kind}")
}

/// Path external WebSocket clients upgrade on to reach a host.
pub fn external_ws_path(host_id: &str) -> String {
    format!("/{EXTERNAL_PREFIX}/{host_id}/ws")
}

/// External HTTP request forwarded to the host, relay → host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestFrame {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub body_base64: String,
    pub content_type: String,
}

impl HttpRequestFrame {
    pub fn body(&self) -> Result<Vec<u8>, FrameError> {
        decode_payload(&self.body_base64)
    }
}

/// Host answer to a forwarded request, host → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseFrame {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub body_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl HttpResponseFrame {
    pub fn new(request_id: impl Into<String>, status: u16, body: &[u8]) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            body_base64: STANDARD.encode(body),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn body(&self) -> Result<Vec<u8>, FrameError> {
        decode_payload(&self.body_base64)
    }

    /// Content type to apply to the external response. Empty strings count as absent.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref().filter(|value| !value.is_empty())
    }
}

/// One WebSocket message for a multiplexed client. Same shape in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsDataFrame {
    pub client_id: String,
    pub payload_base64: String,
}

impl WsDataFrame {
    pub fn new(client_id: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            client_id: client_id.into(),
            payload_base64: STANDARD.encode(payload),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, FrameError> {
        decode_payload(&self.payload_base64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEvent {
    Disconnect,
}

/// A multiplexed client went away. Relay → host when the external side closes;
/// host → relay when the host wants that client dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsDisconnectFrame {
    pub client_id: String,
    /// Always null on the wire; a frame carrying a payload is data, not a disconnect.
    #[serde(default, deserialize_with = "null_payload")]
    pub payload_base64: Option<String>,
    pub event: WsEvent,
}

fn null_payload<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(_) => Err(de::Error::custom("disconnect frame with a payload")),
    }
}

impl WsDisconnectFrame {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            payload_base64: None,
            event: WsEvent::Disconnect,
        }
    }
}

/// Every frame that can travel over a tunnel.
///
/// The wire format carries no explicit tag, so variants are tried in order:
/// the disconnect notice must come before plain data because both carry a
/// `clientId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TunnelFrame {
    WsDisconnect(WsDisconnectFrame),
    WsData(WsDataFrame),
    HttpResponse(HttpResponseFrame),
    HttpRequest(HttpRequestFrame),
}

impl TunnelFrame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: TunnelFrame = serde_json::from_str(text).map_err(FrameError::Json)?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn encode(&self) -> String {
        // Only strings and integers inside; serializing cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TunnelFrame::WsDisconnect(_) => "ws_disconnect",
            TunnelFrame::WsData(_) => "ws_data",
            TunnelFrame::HttpResponse(_) => "http_response",
            TunnelFrame::HttpRequest(_) => "http_request",
        }
    }

    fn validate(&self) -> Result<(), FrameError> {
        if let TunnelFrame::HttpResponse(response) = self {
            if !(100..=999).contains(&response.status) {
                return Err(FrameError::InvalidStatus(response.status));
            }
        }
        Ok(())
    }
}

impl From<HttpRequestFrame> for TunnelFrame {
    fn from(value: HttpRequestFrame) -> Self {
        TunnelFrame::HttpRequest(value)
    }
}

impl From<HttpResponseFrame> for TunnelFrame {
    fn from(value: HttpResponseFrame) -> Self {
        TunnelFrame::HttpResponse(value)
    }
}

impl From<WsDataFrame> for TunnelFrame {
    fn from(value: WsDataFrame) -> Self {
        TunnelFrame::WsData(value)
    }
}

impl From<WsDisconnectFrame> for TunnelFrame {
    fn from(value: WsDisconnectFrame) -> Self {
        TunnelFrame::WsDisconnect(value)
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, FrameError> {
    STANDARD.decode(encoded).map_err(FrameError::Base64)
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame json: {0}")]
    Json(serde_json::Error),
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("invalid base64 payload: {0}")]
    Base64(base64::DecodeError),
    #[error("status code {0} out of range")]
    InvalidStatus(u16),
    #[error("unknown tunnel kind {0:?}")]
    UnknownTunnelKind(String),
}

impl FrameError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            FrameError::Json(_) => "invalid_json",
            FrameError::NotUtf8 => "not_utf8",
            FrameError::Base64(_) => "invalid_base64",
            FrameError::InvalidStatus(_) => "invalid_status",
            FrameError::UnknownTunnelKind(_) => "unknown_tunnel_kind",
        }
    }
}
