//! # RPC Layer
//!
//! UDP transport for the DHT protocol. One socket carries both directions:
//! outbound calls and inbound requests.
//!
//! ## Architecture
//!
//! The RPC layer uses the **Actor Pattern**:
//! - [`RpcNode`]: public handle (cheap to clone) for making calls
//! - `RpcNodeActor`: owns the table of outstanding calls
//! - [`serve`]: receive loop dispatching requests to a [`DhtNode`] and
//!   responses to the actor
//!
//! ## Call Correlation
//!
//! Each call carries a random 20-byte id. The actor holds one pending entry
//! per id with its destination and deadline. A response resolves the entry
//! only if it arrives from the address the request was sent to; anything
//! else is logged and dropped. Entries past their deadline are swept
//! periodically in case the caller gave up without cancelling.
//!
//! ## Limits
//!
//! - Datagrams over `MAX_DATAGRAM_SIZE` are dropped unread
//! - Contact lists are truncated to `MAX_CONTACTS_PER_RESPONSE`
//! - Values over `MAX_VALUE_SIZE` are rejected in both directions

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::MAX_RPC_TIMEOUT_MS;
use crate::dht::DhtNode;
use crate::error::DhtError;
use crate::identity::{Contact, Key, NodeId};
use crate::messages::{
    Body, DhtRequest, DhtResponse, Envelope, MAX_CONTACTS_PER_RESPONSE, MAX_DATAGRAM_SIZE,
    MAX_VALUE_SIZE, PROTOCOL_VERSION, RpcId, decode_envelope, encode_envelope,
};
use crate::protocols::{DhtNodeRpc, FindValueResult};

/// Maximum number of outstanding calls.
const MAX_PENDING_CALLS: usize = 4_096;

/// Command channel capacity for the RPC actor.
const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

/// Interval for sweeping expired pending calls.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Actor Commands
// ============================================================================

enum RpcCommand {
    /// Track a call before its request is sent
    Register {
        rpc_id: RpcId,
        addr: SocketAddr,
        deadline: Instant,
        reply: oneshot::Sender<(NodeId, DhtResponse)>,
        /// Answered `false` when the call is refused
        accepted: oneshot::Sender<bool>,
    },
    /// A response datagram arrived
    Resolve {
        rpc_id: RpcId,
        sender: NodeId,
        response: DhtResponse,
        from: SocketAddr,
    },
    /// The caller stopped waiting
    Cancel { rpc_id: RpcId },
    /// Shutdown the actor
    Quit,
}

// ============================================================================
// Actor (owns all mutable state)
// ============================================================================

struct PendingCall {
    addr: SocketAddr,
    deadline: Instant,
    reply: oneshot::Sender<(NodeId, DhtResponse)>,
}

struct RpcNodeActor {
    pending: HashMap<RpcId, PendingCall>,
    max_pending: usize,
}

impl RpcNodeActor {
    fn new(max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::Register { rpc_id, addr, deadline, reply, accepted }) => {
                            if self.pending.len() >= self.max_pending {
                                warn!(
                                    %addr,
                                    max = self.max_pending,
                                    "too many outstanding calls, refusing new call"
                                );
                                let _ = accepted.send(false);
                                continue;
                            }
                            self.pending.insert(rpc_id, PendingCall { addr, deadline, reply });
                            let _ = accepted.send(true);
                        }
                        Some(RpcCommand::Resolve { rpc_id, sender, response, from }) => {
                            self.resolve(rpc_id, sender, response, from);
                        }
                        Some(RpcCommand::Cancel { rpc_id }) => {
                            self.pending.remove(&rpc_id);
                        }
                        Some(RpcCommand::Quit) | None => {
                            debug!("RpcNode actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_expired();
                }
            }
        }
    }

    fn resolve(&mut self, rpc_id: RpcId, sender: NodeId, response: DhtResponse, from: SocketAddr) {
        match self.pending.get(&rpc_id) {
            None => {
                warn!(
                    %from,
                    rpc_id = ?hex::encode(&rpc_id[..8]),
                    "dropping response for unknown call"
                );
            }
            Some(call) if call.addr != from => {
                warn!(
                    %from,
                    expected = %call.addr,
                    rpc_id = ?hex::encode(&rpc_id[..8]),
                    "dropping response from unexpected address"
                );
            }
            Some(_) => {
                if let Some(call) = self.pending.remove(&rpc_id) {
                    let _ = call.reply.send((sender, response));
                }
            }
        }
    }

    fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|_, call| call.deadline > now);
        let removed = before - self.pending.len();
        if removed > 0 {
            trace!(removed, "swept expired pending calls");
        }
    }
}

// ============================================================================
// Public Handle
// ============================================================================

/// UDP RPC endpoint.
#[derive(Clone)]
pub struct RpcNode {
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    timeout: Duration,
    cmd_tx: mpsc::Sender<RpcCommand>,
}

impl RpcNode {
    pub async fn bind(addr: SocketAddr, local_id: NodeId, timeout: Duration) -> Result<Self> {
        Self::bind_with_pending_limit(addr, local_id, timeout, MAX_PENDING_CALLS).await
    }

    async fn bind_with_pending_limit(
        addr: SocketAddr,
        local_id: NodeId,
        timeout: Duration,
        max_pending: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        tokio::spawn(RpcNodeActor::new(max_pending).run(cmd_rx));

        Ok(Self {
            socket: Arc::new(socket),
            local_id,
            timeout: timeout.min(Duration::from_millis(MAX_RPC_TIMEOUT_MS)),
            cmd_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }

    /// Send `request` to `addr` and wait for the matching response.
    pub async fn call(&self, addr: SocketAddr, request: DhtRequest) -> Result<(NodeId, DhtResponse)> {
        let rpc_id: RpcId = rand::random();
        let kind = request.kind();
        let bytes = encode_envelope(&Envelope::request(rpc_id, self.local_id, request))
            .context("failed to encode request")?;

        let (tx, rx) = oneshot::channel();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::Register {
                rpc_id,
                addr,
                deadline: Instant::now() + self.timeout,
                reply: tx,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| anyhow!(DhtError::Shutdown))?;
        match accepted_rx.await {
            Ok(true) => {}
            Ok(false) => return Err(DhtError::Overloaded.into()),
            Err(_) => return Err(DhtError::Shutdown.into()),
        }

        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            let _ = self.cmd_tx.send(RpcCommand::Cancel { rpc_id }).await;
            return Err(e).with_context(|| format!("failed to send {kind} to {addr}"));
        }
        trace!(%addr, kind, rpc_id = ?hex::encode(&rpc_id[..8]), "sent request");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            // The actor dropped the pending call on its way out.
            Ok(Err(_)) => Err(DhtError::Shutdown.into()),
            Err(_) => {
                let _ = self.cmd_tx.send(RpcCommand::Cancel { rpc_id }).await;
                Err(DhtError::Timeout { addr }.into())
            }
        }
    }

    /// Call a known contact, insisting that the responder is that contact.
    async fn call_contact(&self, to: &Contact, request: DhtRequest) -> Result<DhtResponse> {
        let (sender, response) = self.call(to.addr, request).await?;
        if sender != to.id {
            return Err(DhtError::Malformed(format!(
                "{} answered as {} instead of {}",
                to.addr, sender, to.id
            ))
            .into());
        }
        Ok(response)
    }

    async fn resolve(&self, rpc_id: RpcId, sender: NodeId, response: DhtResponse, from: SocketAddr) {
        let _ = self
            .cmd_tx
            .send(RpcCommand::Resolve {
                rpc_id,
                sender,
                response,
                from,
            })
            .await;
    }
}

fn truncate_contacts(peer: &SocketAddr, nodes: Vec<Contact>) -> Vec<Contact> {
    if nodes.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            %peer,
            count = nodes.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
        nodes.into_iter().take(MAX_CONTACTS_PER_RESPONSE).collect()
    } else {
        nodes
    }
}

fn unexpected(kind: &str, response: &DhtResponse) -> anyhow::Error {
    DhtError::Malformed(format!("unexpected response to {kind}: {response:?}")).into()
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn ping(&self, addr: SocketAddr) -> Result<NodeId> {
        match self.call(addr, DhtRequest::Ping).await? {
            (sender, DhtResponse::Pong) => Ok(sender),
            (_, other) => Err(unexpected("PING", &other)),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        match self.call_contact(to, DhtRequest::Store { key, value }).await? {
            DhtResponse::Stored => Ok(()),
            other => Err(unexpected("STORE", &other)),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        match self.call_contact(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(nodes) => Ok(truncate_contacts(&to.addr, nodes)),
            other => Err(unexpected("FIND_NODE", &other)),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResult> {
        match self.call_contact(to, DhtRequest::FindValue { key }).await? {
            DhtResponse::Value(value) => {
                if value.len() > MAX_VALUE_SIZE {
                    warn!(
                        peer = %to.addr,
                        size = value.len(),
                        max = MAX_VALUE_SIZE,
                        "peer returned oversized value, rejecting"
                    );
                    return Err(DhtError::ValueTooLarge {
                        size: value.len(),
                        max: MAX_VALUE_SIZE,
                    }
                    .into());
                }
                Ok(FindValueResult::Value(value))
            }
            DhtResponse::Nodes(nodes) => Ok(FindValueResult::Nodes(truncate_contacts(&to.addr, nodes))),
            other => Err(unexpected("FIND_VALUE", &other)),
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Receive loop: answers requests through `dht` and hands responses to `rpc`.
///
/// Runs until the socket fails; callers stop it by aborting the task.
pub async fn serve(rpc: RpcNode, dht: DhtNode<RpcNode>) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        let (len, from) = match rpc.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP port unreachable from an earlier send surfaces here on some platforms.
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e).context("UDP receive failed"),
        };

        if len > MAX_DATAGRAM_SIZE {
            warn!(%from, len, max = MAX_DATAGRAM_SIZE, "dropping oversized datagram");
            continue;
        }

        let envelope = match decode_envelope(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from, len, error = %e, "dropping malformed datagram");
                continue;
            }
        };
        if envelope.version != PROTOCOL_VERSION {
            warn!(
                %from,
                version = envelope.version,
                expected = PROTOCOL_VERSION,
                "dropping datagram with unsupported version"
            );
            continue;
        }

        let Envelope { rpc_id, sender, body, .. } = envelope;
        match body {
            Body::Response(response) => {
                rpc.resolve(rpc_id, sender, response, from).await;
            }
            Body::Request(request) => {
                let rpc = rpc.clone();
                let dht = dht.clone();
                tokio::spawn(async move {
                    let from_contact = Contact::new(sender, from);
                    let response = handle_dht_rpc(&dht, from_contact, request).await;
                    let reply = Envelope::response(rpc_id, rpc.local_id, response);
                    match encode_envelope(&reply) {
                        Ok(bytes) => {
                            if let Err(e) = rpc.socket.send_to(&bytes, from).await {
                                debug!(%from, error = %e, "failed to send response");
                            }
                        }
                        Err(e) => warn!(%from, error = %e, "failed to encode response"),
                    }
                });
            }
        }
    }
}

async fn handle_dht_rpc<N: DhtNodeRpc>(
    node: &DhtNode<N>,
    from: Contact,
    request: DhtRequest,
) -> DhtResponse {
    match request {
        DhtRequest::Ping => {
            trace!(
                from = ?hex::encode(&from.id.as_bytes()[..8]),
                "handling PING request"
            );
            node.handle_ping_request(&from).await;
            DhtResponse::Pong
        }
        DhtRequest::FindNode { target } => {
            trace!(
                from = ?hex::encode(&from.id.as_bytes()[..8]),
                target = ?hex::encode(&target.as_bytes()[..8]),
                "handling FIND_NODE request"
            );
            let mut nodes = node.handle_find_node_request(&from, target).await;
            nodes.truncate(MAX_CONTACTS_PER_RESPONSE);
            debug!(
                from = ?hex::encode(&from.id.as_bytes()[..8]),
                returned = nodes.len(),
                "FIND_NODE response"
            );
            DhtResponse::Nodes(nodes)
        }
        DhtRequest::FindValue { key } => {
            trace!(
                from = ?hex::encode(&from.id.as_bytes()[..8]),
                key = ?hex::encode(&key[..8]),
                "handling FIND_VALUE request"
            );
            match node.handle_find_value_request(&from, key).await {
                FindValueResult::Value(value) => {
                    debug!(
                        from = ?hex::encode(&from.id.as_bytes()[..8]),
                        found = true,
                        "FIND_VALUE response"
                    );
                    DhtResponse::Value(value)
                }
                FindValueResult::Nodes(mut nodes) => {
                    nodes.truncate(MAX_CONTACTS_PER_RESPONSE);
                    debug!(
                        from = ?hex::encode(&from.id.as_bytes()[..8]),
                        found = false,
                        closer_nodes = nodes.len(),
                        "FIND_VALUE response"
                    );
                    DhtResponse::Nodes(nodes)
                }
            }
        }
        DhtRequest::Store { key, value } => {
            debug!(
                from = ?hex::encode(&from.id.as_bytes()[..8]),
                key = ?hex::encode(&key[..8]),
                value_len = value.len(),
                "handling STORE request"
            );
            node.handle_store_request(&from, key, value).await;
            DhtResponse::Stored
        }
    }
}
