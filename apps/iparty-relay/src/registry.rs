use std::{
    borrow::Cow,
    collections::HashMap,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{CloseFrame, Message};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tunnel_proto::{TunnelFrame, TunnelKind};
use uuid::Uuid;

/// Write side of one WebSocket connection. Frames are pushed onto the
/// connection's writer task so callers never wait on the socket.
#[derive(Clone, Debug)]
pub struct TunnelHandle {
    id: Uuid,
    kind: TunnelKind,
    outbound: mpsc::UnboundedSender<Message>,
}

impl TunnelHandle {
    pub fn new(kind: TunnelKind, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            outbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    /// False once the connection's writer has gone away.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send_frame(&self, frame: impl Into<TunnelFrame>) -> bool {
        self.outbound
            .send(Message::Text(frame.into().encode()))
            .is_ok()
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.outbound.send(close_message(code, reason));
    }
}

/// An external WebSocket session multiplexed onto a host's WS tunnel.
#[derive(Clone, Debug)]
pub struct ExternalClient {
    outbound: mpsc::UnboundedSender<Message>,
}

impl ExternalClient {
    pub fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { outbound }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send_bytes(&self, payload: Vec<u8>) -> bool {
        self.outbound.send(Message::Binary(payload)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.outbound.send(close_message(code, reason));
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

/// Reply produced by the host for a bridged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReply {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOutcome {
    Reply(HostReply),
    TunnelClosed,
}

/// A bridged HTTP request waiting for its answer. Whoever removes it from the
/// host's map owns the only right to resolve it.
#[derive(Debug)]
pub struct PendingRequest {
    responder: oneshot::Sender<PendingOutcome>,
    created: Instant,
}

impl PendingRequest {
    pub fn resolve(self, outcome: PendingOutcome) -> bool {
        self.responder.send(outcome).is_ok()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }
}

/// Handed to the HTTP bridge once a request has been admitted.
#[derive(Debug)]
pub struct PendingTicket {
    pub request_id: String,
    pub tunnel: TunnelHandle,
    pub receiver: oneshot::Receiver<PendingOutcome>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("no live {0} tunnel")]
    TunnelNotConnected(TunnelKind),
}

#[derive(Clone, Default)]
pub struct TunnelRegistry {
    hosts: Arc<DashMap<String, Arc<HostTunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host_id: &str) -> Option<Arc<HostTunnel>> {
        self.hosts.get(host_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_or_create(&self, host_id: &str) -> Arc<HostTunnel> {
        if let Some(existing) = self.get(host_id) {
            return existing;
        }
        match self.hosts.entry(host_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let host = Arc::new(HostTunnel::new(host_id.to_string()));
                entry.insert(Arc::clone(&host));
                host
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        // Clone the Arcs first so no shard guard is held while locking hosts.
        let hosts: Vec<Arc<HostTunnel>> = self
            .hosts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<HostSnapshot> = hosts.iter().map(|host| host.snapshot()).collect();
        snapshots.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        snapshots
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostSnapshot {
    pub host_id: String,
    pub created_at_ms: u64,
    pub http_connected: bool,
    pub ws_connected: bool,
    pub pending_requests: usize,
    pub external_clients: usize,
}

/// Everything the relay knows about one host. Entries are never removed from
/// the registry; a host with both tunnels absent simply waits for a reconnect.
pub struct HostTunnel {
    host_id: String,
    created_at_ms: u64,
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    http_tunnel: Option<TunnelHandle>,
    ws_tunnel: Option<TunnelHandle>,
    pending_requests: HashMap<String, PendingRequest>,
    external_clients: HashMap<String, ExternalClient>,
}

impl HostState {
    fn slot(&mut self, kind: TunnelKind) -> &mut Option<TunnelHandle> {
        match kind {
            TunnelKind::Http => &mut self.http_tunnel,
            TunnelKind::Ws => &mut self.ws_tunnel,
        }
    }

    fn live(&self, kind: TunnelKind) -> Option<&TunnelHandle> {
        let slot = match kind {
            TunnelKind::Http => &self.http_tunnel,
            TunnelKind::Ws => &self.ws_tunnel,
        };
        slot.as_ref().filter(|tunnel| tunnel.is_open())
    }
}

impl HostTunnel {
    fn new(host_id: String) -> Self {
        Self {
            host_id,
            created_at_ms: now_millis(),
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Installs `tunnel` in its role and returns whatever held the role before.
    pub fn install(&self, tunnel: TunnelHandle) -> Option<TunnelHandle> {
        let mut state = self.state.lock();
        state.slot(tunnel.kind()).replace(tunnel)
    }

    pub fn live_tunnel(&self, kind: TunnelKind) -> Option<TunnelHandle> {
        self.state.lock().live(kind).cloned()
    }

    pub fn is_connected(&self, kind: TunnelKind) -> bool {
        self.state.lock().live(kind).is_some()
    }

    /// Clears the HTTP role if `tunnel_id` still holds it and hands back every
    /// pending request for the caller to fail. `None` means the tunnel was
    /// already replaced and nothing here belongs to it.
    pub fn release_http_tunnel(&self, tunnel_id: Uuid) -> Option<Vec<(String, PendingRequest)>> {
        let mut state = self.state.lock();
        if state.http_tunnel.as_ref().map(TunnelHandle::id) != Some(tunnel_id) {
            return None;
        }
        state.http_tunnel = None;
        Some(state.pending_requests.drain().collect())
    }

    /// WS counterpart of [`release_http_tunnel`](Self::release_http_tunnel).
    pub fn release_ws_tunnel(&self, tunnel_id: Uuid) -> Option<Vec<(String, ExternalClient)>> {
        let mut state = self.state.lock();
        if state.ws_tunnel.as_ref().map(TunnelHandle::id) != Some(tunnel_id) {
            return None;
        }
        state.ws_tunnel = None;
        Some(state.external_clients.drain().collect())
    }

    /// Admits a bridged request: checks the HTTP tunnel and records the pending
    /// entry under a single lock so a concurrent close cannot miss it.
    pub fn begin_request(&self) -> Result<PendingTicket, AdmissionError> {
        let mut state = self.state.lock();
        let tunnel = state
            .live(TunnelKind::Http)
            .cloned()
            .ok_or(AdmissionError::TunnelNotConnected(TunnelKind::Http))?;
        let request_id = Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();
        state.pending_requests.insert(
            request_id.clone(),
            PendingRequest {
                responder,
                created: Instant::now(),
            },
        );
        Ok(PendingTicket {
            request_id,
            tunnel,
            receiver,
        })
    }

    pub fn take_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.state.lock().pending_requests.remove(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending_requests.len()
    }

    /// Registers a client on the WS tunnel, refusing when the tunnel is absent.
    pub fn attach_client(
        &self,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Result<String, AdmissionError> {
        let mut state = self.state.lock();
        if state.live(TunnelKind::Ws).is_none() {
            return Err(AdmissionError::TunnelNotConnected(TunnelKind::Ws));
        }
        let client_id = Uuid::new_v4().to_string();
        state
            .external_clients
            .insert(client_id.clone(), ExternalClient::new(outbound));
        Ok(client_id)
    }

    /// Removes a client. Returns `None` when it was already gone, otherwise the
    /// client and the WS tunnel (if still live) that should hear about it.
    pub fn detach_client(&self, client_id: &str) -> Option<(ExternalClient, Option<TunnelHandle>)> {
        let mut state = self.state.lock();
        let client = state.external_clients.remove(client_id)?;
        let tunnel = state.live(TunnelKind::Ws).cloned();
        Some((client, tunnel))
    }

    /// The client, if it is still attached and its socket is open.
    pub fn client(&self, client_id: &str) -> Option<ExternalClient> {
        self.state
            .lock()
            .external_clients
            .get(client_id)
            .filter(|client| client.is_open())
            .cloned()
    }

    /// The live WS tunnel, provided `client_id` is still attached to it.
    pub fn tunnel_for_client(&self, client_id: &str) -> Option<TunnelHandle> {
        let state = self.state.lock();
        if !state.external_clients.contains_key(client_id) {
            return None;
        }
        state.live(TunnelKind::Ws).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().external_clients.len()
    }

    pub fn snapshot(&self) -> HostSnapshot {
        let state = self.state.lock();
        HostSnapshot {
            host_id: self.host_id.clone(),
            created_at_ms: self.created_at_ms,
            http_connected: state.live(TunnelKind::Http).is_some(),
            ws_connected: state.live(TunnelKind::Ws).is_some(),
            pending_requests: state.pending_requests.len(),
            external_clients: state.external_clients.len(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
