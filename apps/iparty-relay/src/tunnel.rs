//! Host-side tunnel sockets (`/unity/{host_id}/{http|ws}`).

use axum::extract::ws::{close_code, Message, WebSocket};
use futures_util::StreamExt;
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_proto::{FrameError, TunnelFrame, TunnelKind};

use crate::{
    bridge,
    lifecycle::{self, REPLACED_REASON},
    mux,
    registry::{HostTunnel, TunnelHandle, TunnelRegistry},
    socket::spawn_writer,
};

/// Installed tunnels per role across all hosts.
pub(crate) const TUNNELS_GAUGE: &str = "iparty_relay_tunnels_active";

pub async fn serve_host_tunnel(
    socket: WebSocket,
    registry: TunnelRegistry,
    host_id: String,
    kind: TunnelKind,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound, rx) = mpsc::unbounded_channel();
    let mut writer = spawn_writer(ws_tx, rx);

    let handle = TunnelHandle::new(kind, outbound);
    let tunnel_id = handle.id();
    let host = registry.get_or_create(&host_id);
    if let Some(previous) = host.install(handle) {
        decrement_gauge!(TUNNELS_GAUGE, 1.0, "kind" => kind.as_str());
        if previous.is_open() {
            warn!(
                host_id = %host_id,
                kind = %kind,
                previous = %previous.id(),
                "replacing live tunnel"
            );
            previous.close(close_code::NORMAL, REPLACED_REASON);
        }
    }

    info!(host_id = %host_id, tunnel_id = %tunnel_id, kind = %kind, "host tunnel registered");
    counter!("iparty_relay_tunnels_registered_total", 1, "kind" => kind.as_str());
    increment_gauge!(TUNNELS_GAUGE, 1.0, "kind" => kind.as_str());

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = &mut writer => break,
        };
        let decoded = match message {
            Some(Ok(Message::Text(text))) => TunnelFrame::decode(&text),
            Some(Ok(Message::Binary(bytes))) => TunnelFrame::decode_slice(&bytes),
            Some(Ok(Message::Close(frame))) => {
                debug!(host_id = %host_id, kind = %kind, ?frame, "host closed tunnel");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(host_id = %host_id, kind = %kind, error = %err, "tunnel socket error");
                break;
            }
            None => break,
        };
        match decoded {
            Ok(frame) => {
                route_host_frame(&host, kind, frame);
            }
            Err(err) => reject_frame(&host, kind, &err),
        }
    }

    lifecycle::tunnel_closed(&host, kind, tunnel_id);
    writer.abort();
}

/// Hands a decoded host frame to the side that owns it. Returns false when the
/// frame had no effect.
pub fn route_host_frame(host: &HostTunnel, kind: TunnelKind, frame: TunnelFrame) -> bool {
    match (kind, frame) {
        (TunnelKind::Http, TunnelFrame::HttpResponse(response)) => bridge::complete(host, response),
        (TunnelKind::Ws, TunnelFrame::WsData(data)) => mux::deliver(host, data),
        (TunnelKind::Ws, TunnelFrame::WsDisconnect(disconnect)) => mux::kick(host, disconnect),
        (kind, frame) => {
            warn!(
                host_id = %host.host_id(),
                kind = %kind,
                frame = frame.kind(),
                "frame not valid on this tunnel"
            );
            counter!("iparty_relay_malformed_frames_total", 1, "reason" => "wrong_tunnel");
            false
        }
    }
}

fn reject_frame(host: &HostTunnel, kind: TunnelKind, err: &FrameError) {
    warn!(
        host_id = %host.host_id(),
        kind = %kind,
        error = %err,
        "invalid tunnel message"
    );
    counter!("iparty_relay_malformed_frames_total", 1, "reason" => err.metric_label());
}
