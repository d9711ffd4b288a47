//! WebSocket side of the relay: many external sessions share the host's single
//! WS tunnel, each frame tagged with the session's client id.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, Message, WebSocket},
        WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_proto::{TunnelKind, WsDataFrame, WsDisconnectFrame};

use crate::{
    error::UpgradeError,
    lifecycle::TUNNEL_CLOSED_REASON,
    registry::HostTunnel,
    socket::{data_bytes, spawn_writer},
};

pub const CLOSED_BY_HOST_REASON: &str = "Closed by host";
/// Attached external clients across all hosts.
pub(crate) const CLIENTS_GAUGE: &str = "iparty_relay_external_clients";

/// Upgrade handler for `/host/{host_id}/ws`. Refuses before upgrading when the
/// host has no live WS tunnel.
pub fn accept(host_id: &str, host: Option<Arc<HostTunnel>>, ws: WebSocketUpgrade) -> Response {
    let Some(host) = host.filter(|host| host.is_connected(TunnelKind::Ws)) else {
        warn!(
            host_id = %host_id,
            "external client tried WS but host WS tunnel not connected"
        );
        let rejection = UpgradeError::WsTunnelNotConnected;
        counter!(
            "iparty_relay_upgrades_rejected_total",
            1,
            "reason" => rejection.metric_label()
        );
        return rejection.into_response();
    };
    ws.on_upgrade(move |socket| serve_external_client(socket, host))
}

pub async fn serve_external_client(socket: WebSocket, host: Arc<HostTunnel>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound, rx) = mpsc::unbounded_channel();
    let mut writer = spawn_writer(ws_tx, rx);

    let client_id = match host.attach_client(outbound.clone()) {
        Ok(client_id) => client_id,
        Err(err) => {
            // The tunnel went away between the upgrade check and now.
            debug!(host_id = %host.host_id(), error = %err, "dropping late external client");
            let _ = outbound.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: close_code::ERROR,
                reason: TUNNEL_CLOSED_REASON.into(),
            })));
            drop(outbound);
            let _ = writer.await;
            return;
        }
    };
    // From here on the registry owns the only sender.
    drop(outbound);

    info!(
        host_id = %host.host_id(),
        client_id = %client_id,
        "external WS client connected"
    );
    increment_gauge!(CLIENTS_GAUGE, 1.0);

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = &mut writer => break,
        };
        match message {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(message)) => {
                if let Some(payload) = data_bytes(message) {
                    forward_from_client(&host, &client_id, &payload);
                }
            }
            Some(Err(err)) => {
                debug!(
                    host_id = %host.host_id(),
                    client_id = %client_id,
                    error = %err,
                    "external client socket error"
                );
                break;
            }
        }
    }

    client_disconnected(&host, &client_id);
    writer.abort();
}

/// External client → host. Dropped when the client is no longer attached.
pub fn forward_from_client(host: &HostTunnel, client_id: &str, payload: &[u8]) -> bool {
    let Some(tunnel) = host.tunnel_for_client(client_id) else {
        return false;
    };
    let sent = tunnel.send_frame(WsDataFrame::new(client_id, payload));
    if sent {
        counter!("iparty_relay_ws_frames_total", 1, "direction" => "to_host");
    }
    sent
}

/// External side went away: forget the client and tell the host, if the
/// client was still attached and the tunnel is still live.
pub fn client_disconnected(host: &HostTunnel, client_id: &str) -> bool {
    let Some((_, tunnel)) = host.detach_client(client_id) else {
        return false;
    };
    info!(
        host_id = %host.host_id(),
        client_id = %client_id,
        "external WS client disconnected"
    );
    decrement_gauge!(CLIENTS_GAUGE, 1.0);
    match tunnel {
        Some(tunnel) => tunnel.send_frame(WsDisconnectFrame::new(client_id)),
        None => false,
    }
}

/// Host → external client.
pub fn deliver(host: &HostTunnel, frame: WsDataFrame) -> bool {
    let payload = match frame.payload() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(
                host_id = %host.host_id(),
                client_id = %frame.client_id,
                error = %err,
                "dropping WS frame with undecodable payload"
            );
            counter!("iparty_relay_malformed_frames_total", 1, "reason" => err.metric_label());
            return false;
        }
    };
    let Some(client) = host.client(&frame.client_id) else {
        debug!(
            host_id = %host.host_id(),
            client_id = %frame.client_id,
            "frame for unknown or closed client dropped"
        );
        return false;
    };
    let sent = client.send_bytes(payload);
    if sent {
        counter!("iparty_relay_ws_frames_total", 1, "direction" => "to_client");
    }
    sent
}

/// The host asked for a client to be dropped.
pub fn kick(host: &HostTunnel, frame: WsDisconnectFrame) -> bool {
    let Some((client, _)) = host.detach_client(&frame.client_id) else {
        return false;
    };
    info!(
        host_id = %host.host_id(),
        client_id = %frame.client_id,
        "host closed external WS client"
    );
    client.close(close_code::NORMAL, CLOSED_BY_HOST_REASON);
    decrement_gauge!(CLIENTS_GAUGE, 1.0);
    true
}
