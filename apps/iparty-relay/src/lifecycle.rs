//! Cascades applied when a host tunnel goes away.

use axum::extract::ws::close_code;
use metrics::{counter, decrement_gauge};
use tracing::{debug, info};
use tunnel_proto::TunnelKind;
use uuid::Uuid;

use crate::{
    mux::CLIENTS_GAUGE,
    registry::{HostTunnel, PendingOutcome},
    tunnel::TUNNELS_GAUGE,
};

pub const TUNNEL_CLOSED_REASON: &str = "Tunnel closed";
pub const REPLACED_REASON: &str = "Replaced by new tunnel";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CascadeReport {
    /// False when the closing tunnel had already been replaced.
    pub was_current: bool,
    pub failed_requests: usize,
    pub closed_clients: usize,
}

/// Runs the close handler for the tunnel `tunnel_id` of the given kind. Every
/// dependent is resolved before this returns; a stale tunnel touches nothing.
pub fn tunnel_closed(host: &HostTunnel, kind: TunnelKind, tunnel_id: Uuid) -> CascadeReport {
    let report = match kind {
        TunnelKind::Http => close_http_tunnel(host, tunnel_id),
        TunnelKind::Ws => close_ws_tunnel(host, tunnel_id),
    };

    if report.was_current {
        info!(
            host_id = %host.host_id(),
            tunnel_id = %tunnel_id,
            kind = %kind,
            failed_requests = report.failed_requests,
            closed_clients = report.closed_clients,
            "tunnel closed"
        );
        counter!("iparty_relay_tunnels_closed_total", 1, "kind" => kind.as_str());
        decrement_gauge!(TUNNELS_GAUGE, 1.0, "kind" => kind.as_str());
    } else {
        debug!(
            host_id = %host.host_id(),
            tunnel_id = %tunnel_id,
            kind = %kind,
            "replaced tunnel closed; nothing to clean up"
        );
    }
    report
}

fn close_http_tunnel(host: &HostTunnel, tunnel_id: Uuid) -> CascadeReport {
    let Some(drained) = host.release_http_tunnel(tunnel_id) else {
        return CascadeReport::default();
    };
    let failed_requests = drained.len();
    for (_, pending) in drained {
        pending.resolve(PendingOutcome::TunnelClosed);
    }
    CascadeReport {
        was_current: true,
        failed_requests,
        closed_clients: 0,
    }
}

fn close_ws_tunnel(host: &HostTunnel, tunnel_id: Uuid) -> CascadeReport {
    let Some(drained) = host.release_ws_tunnel(tunnel_id) else {
        return CascadeReport::default();
    };
    let closed_clients = drained.len();
    for (_, client) in drained {
        client.close(close_code::ERROR, TUNNEL_CLOSED_REASON);
    }
    decrement_gauge!(CLIENTS_GAUGE, closed_clients as f64);
    CascadeReport {
        was_current: true,
        failed_requests: 0,
        closed_clients,
    }
}
