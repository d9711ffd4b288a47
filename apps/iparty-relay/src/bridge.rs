//! HTTP side of the relay: external requests become tunnel frames, tunnel
//! frames become external responses.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use tunnel_proto::{encode_payload, HttpRequestFrame, HttpResponseFrame};

use crate::{
    error::BridgeError,
    registry::{AdmissionError, HostReply, HostTunnel, PendingOutcome},
};

/// What the relay captured from the external caller.
#[derive(Debug, Clone)]
pub struct ExternalRequest {
    pub method: Method,
    pub target: String,
    pub content_type: String,
    pub body: Bytes,
}

impl ExternalRequest {
    pub fn new(method: Method, target: String, headers: &HeaderMap, body: Bytes) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Self {
            method,
            target,
            content_type,
            body,
        }
    }

    fn into_frame(self, request_id: String) -> HttpRequestFrame {
        HttpRequestFrame {
            request_id,
            method: self.method.as_str().to_string(),
            url: self.target,
            body_base64: encode_payload(&self.body),
            content_type: self.content_type,
        }
    }
}

/// Removes the pending entry if the caller goes away before it is resolved.
struct AbandonGuard<'a> {
    host: &'a HostTunnel,
    request_id: &'a str,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.host.take_pending(self.request_id).is_some() {
            debug!(
                host_id = %self.host.host_id(),
                request_id = %self.request_id,
                "external caller abandoned request"
            );
            counter!("iparty_relay_http_requests_total", 1, "outcome" => "abandoned");
        }
    }
}

/// Forwards `request` to the host and waits for exactly one outcome: the
/// host's reply, the tunnel closing, or `deadline` passing.
pub async fn forward(
    host: Option<Arc<HostTunnel>>,
    request: ExternalRequest,
    deadline: Duration,
) -> Result<HostReply, BridgeError> {
    let host = host.ok_or(BridgeError::NotConnected)?;
    let ticket = host.begin_request().map_err(|err| match err {
        AdmissionError::TunnelNotConnected(_) => BridgeError::NotConnected,
    })?;
    let request_id = ticket.request_id;
    let mut receiver = ticket.receiver;
    let _guard = AbandonGuard {
        host: &host,
        request_id: &request_id,
    };

    debug!(
        host_id = %host.host_id(),
        request_id = %request_id,
        method = %request.method,
        url = %request.target,
        bytes = request.body.len(),
        "bridging request"
    );
    let frame = request.into_frame(request_id.clone());
    if !ticket.tunnel.send_frame(frame) && host.take_pending(&request_id).is_some() {
        // Writer already gone; its close handler has not drained us yet.
        return Err(BridgeError::TunnelClosed);
    }

    let started = Instant::now();
    let outcome = match timeout(deadline, &mut receiver).await {
        Ok(received) => received,
        Err(_) => {
            if host.take_pending(&request_id).is_some() {
                warn!(
                    host_id = %host.host_id(),
                    request_id = %request_id,
                    "timed out waiting for host"
                );
                return Err(BridgeError::Timeout);
            }
            // Someone took the entry just as the deadline hit; their outcome is in flight.
            receiver.await
        }
    };
    histogram!(
        "iparty_relay_http_round_trip_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );

    match outcome {
        Ok(PendingOutcome::Reply(reply)) => Ok(reply),
        Ok(PendingOutcome::TunnelClosed) | Err(_) => Err(BridgeError::TunnelClosed),
    }
}

/// Delivers a host reply to whoever is waiting on `frame.request_id`.
/// Returns false when nobody is (late, duplicate or unknown id).
pub fn complete(host: &HostTunnel, frame: HttpResponseFrame) -> bool {
    let body = match frame.body() {
        Ok(body) => body,
        Err(err) => {
            warn!(
                host_id = %host.host_id(),
                request_id = %frame.request_id,
                error = %err,
                "dropping host response with undecodable body"
            );
            counter!("iparty_relay_malformed_frames_total", 1, "reason" => err.metric_label());
            return false;
        }
    };

    let Some(pending) = host.take_pending(&frame.request_id) else {
        debug!(
            host_id = %host.host_id(),
            request_id = %frame.request_id,
            "response for unknown or settled request dropped"
        );
        return false;
    };

    debug!(
        host_id = %host.host_id(),
        request_id = %frame.request_id,
        status = frame.status,
        waited_ms = pending.age().as_millis() as u64,
        "host answered request"
    );
    let reply = HostReply {
        status: frame.status,
        content_type: frame.content_type().map(str::to_string),
        body,
    };
    pending.resolve(PendingOutcome::Reply(reply))
}

pub fn reply_into_response(reply: HostReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    if let Some(content_type) = reply
        .content_type
        .and_then(|value| header::HeaderValue::from_str(&value).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}

/// Entry point used by the router for `/host/{host_id}/http/*`.
pub async fn handle_external(
    host: Option<Arc<HostTunnel>>,
    request: ExternalRequest,
    deadline: Duration,
) -> Response {
    match forward(host, request, deadline).await {
        Ok(reply) => {
            counter!("iparty_relay_http_requests_total", 1, "outcome" => "answered");
            reply_into_response(reply)
        }
        Err(err) => {
            counter!("iparty_relay_http_requests_total", 1, "outcome" => err.metric_label());
            err.into_response()
        }
    }
}
