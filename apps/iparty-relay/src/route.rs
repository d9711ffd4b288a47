//! Path classification for every inbound request.
//!
//! Upgrade requests and plain HTTP requests are matched against separate
//! tables: a WebSocket handshake on an HTTP bridge path is not a match, and
//! neither is a plain request on a tunnel path.

use percent_encoding::percent_decode_str;
use tunnel_proto::{TunnelKind, EXTERNAL_PREFIX, REGISTRATION_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRoute<'a> {
    /// `/unity/{host_id}/{http|ws}`: a host opening one of its tunnels.
    RegisterTunnel { host_id: &'a str, kind: TunnelKind },
    /// `/host/{host_id}/ws`: an external client joining the host's WS multiplex.
    ExternalClient { host_id: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRoute<'a> {
    pub host_id: &'a str,
    /// Decoded path the host sees, always starting with `/`.
    pub target: String,
}

pub fn classify_upgrade(path: &str) -> Option<UpgradeRoute<'_>> {
    let segments = split_path(path)?;
    match segments.as_slice() {
        [prefix, host_id, kind] if *prefix == REGISTRATION_PREFIX && !host_id.is_empty() => {
            let kind = kind.parse().ok()?;
            Some(UpgradeRoute::RegisterTunnel {
                host_id: *host_id,
                kind,
            })
        }
        [prefix, host_id, "ws"] if *prefix == EXTERNAL_PREFIX && !host_id.is_empty() => {
            Some(UpgradeRoute::ExternalClient { host_id: *host_id })
        }
        _ => None,
    }
}

/// Matches `/host/{host_id}/http` and anything below it. The host sees the
/// percent-decoded path only; the query string stays with the relay.
pub fn classify_request(path: &str) -> Option<BridgeRoute<'_>> {
    let rest = path.strip_prefix('/')?;
    let rest = rest.strip_prefix(EXTERNAL_PREFIX)?.strip_prefix('/')?;
    let (host_id, rest) = rest.split_once('/')?;
    if host_id.is_empty() {
        return None;
    }
    let suffix = rest.strip_prefix("http")?;
    let suffix = match suffix {
        "" => "",
        other => other.strip_prefix('/')?,
    };

    let target = format!("/{}", percent_decode_str(suffix).decode_utf8_lossy());
    Some(BridgeRoute { host_id, target })
}

fn split_path(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    Some(rest.split('/').collect())
}
