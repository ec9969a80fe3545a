//! # Kademlia DHT Node
//!
//! [`DhtNode`] is the engine behind the public [`Server`](crate::Server):
//! it owns the routing table and local storage and drives every RPC the
//! node makes or answers.
//!
//! ## Actor Architecture
//!
//! - `DhtNode`: public handle, cheap to clone
//! - `DhtNodeActor`: private actor owning the [`RoutingTable`] and [`Storage`]
//! - Commands arrive over an mpsc channel and are applied one at a time, so
//!   all routing-table mutation happens on a single logical writer
//!
//! Network I/O never runs inside the actor. When a mutation needs a
//! liveness check (full bucket, failed contact) the actor spawns the ping
//! and the outcome comes back as another command.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put(key, value)` | Node lookup for `key`, then STORE on the k closest |
//! | `get(key)` | Local read, then iterative value lookup |
//! | `iterative_find_node(id)` | Converge on the k closest contacts to `id` |
//! | `refresh_table(force)` | Look up random ids in stale buckets, re-store aged entries |
//!
//! ## Liveness
//!
//! - Full bucket that may not split: ping its least-recently-seen contact.
//!   A live head is kept, a dead one is replaced by the newest cached contact.
//! - Failed RPC to a bucket member: ping the oldest cached candidate.
//!   Only if the candidate answers is the failed contact replaced; with an
//!   empty cache the failed contact is removed.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::crawler;
use crate::error::DhtError;
use crate::identity::{Contact, Key, NodeId, distance_cmp};
use crate::messages::MAX_VALUE_SIZE;
use crate::protocols::{DhtNodeRpc, FindValueResult};
use crate::routing::{InsertOutcome, RoutingTable};
use crate::storage::{MemoryStorage, Storage};

/// Capacity of the actor's command channel.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Routing and storage counters, for logging and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub contacts: usize,
    pub buckets: usize,
    pub stored_keys: usize,
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    contact: Contact,
    network: Arc<N>,
    config: Arc<DhtConfig>,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            contact: self.contact,
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    routing: RoutingTable,
    storage: Box<dyn Storage>,
    /// Contacts with a liveness ping in flight.
    pending_pings: HashSet<NodeId>,
    cmd_rx: mpsc::Receiver<Command>,
    /// Weak so the actor stops once every handle is dropped.
    cmd_tx: mpsc::WeakSender<Command>,
    network: Arc<N>,
    local: Contact,
    k: usize,
    value_ttl: Duration,
}

enum Command {
    // State updates
    ObserveContact(Contact),
    ContactFailed(Contact),
    StoreLocal(Key, Vec<u8>),

    // Queries
    FindNeighbors(NodeId, usize, oneshot::Sender<Vec<Contact>>),
    GetLocal(Key, oneshot::Sender<Option<Vec<u8>>>),
    GetStats(oneshot::Sender<NodeStats>),

    // RPC Handlers
    HandleFindNode(Contact, NodeId, oneshot::Sender<Vec<Contact>>),
    HandleFindValue(Contact, Key, oneshot::Sender<FindValueResult>),
    HandleStore(Contact, Key, Vec<u8>),

    // Maintenance
    GetRefreshIds(Duration, bool, oneshot::Sender<Vec<NodeId>>),
    MarkBucketRefreshed(NodeId),
    GetAgedEntries(Duration, oneshot::Sender<Vec<(Key, Vec<u8>)>>),
    RemoveExpired,
    ApplyPingResult { head: Contact, alive: bool },
    ApplyReplacementPing { failed: Contact, candidate: Contact, alive: bool },

    Quit,
}

impl<N: DhtNodeRpc> DhtNode<N> {
    /// Spawn a node backed by in-memory storage.
    pub fn new(contact: Contact, network: N, config: DhtConfig) -> Self {
        Self::with_storage(contact, network, config, MemoryStorage::new())
    }

    /// Spawn a node over any [`Storage`] backend.
    pub fn with_storage(
        contact: Contact,
        network: N,
        config: DhtConfig,
        storage: impl Storage,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let network = Arc::new(network);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(contact.id, config.k),
            storage: Box::new(storage),
            pending_pings: HashSet::new(),
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            network: network.clone(),
            local: contact,
            k: config.k,
            value_ttl: config.value_ttl(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            contact,
            network,
            config: Arc::new(config),
        }
    }

    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    pub fn contact(&self) -> Contact {
        self.contact
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Get a reference to the network layer for making RPC calls.
    pub fn network(&self) -> &N {
        &self.network
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!(DhtError::Shutdown))?;
        rx.await.map_err(|_| anyhow!(DhtError::Shutdown))
    }

    // ------------------------------------------------------------------------
    // Routing table access
    // ------------------------------------------------------------------------

    pub async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    pub async fn contact_failed(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ContactFailed(contact)).await;
    }

    /// Closest known contacts to `target`, nearest first.
    pub async fn find_neighbors(&self, target: NodeId, count: usize) -> Vec<Contact> {
        self.request(|tx| Command::FindNeighbors(target, count, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> NodeStats {
        self.request(Command::GetStats).await.unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------------

    pub async fn handle_ping_request(&self, from: &Contact) {
        self.observe_contact(*from).await;
    }

    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.request(|tx| Command::HandleFindNode(*from, target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_find_value_request(&self, from: &Contact, key: Key) -> FindValueResult {
        self.request(|tx| Command::HandleFindValue(*from, key, tx))
            .await
            .unwrap_or(FindValueResult::Nodes(Vec::new()))
    }

    pub async fn handle_store_request(&self, from: &Contact, key: Key, value: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::HandleStore(*from, key, value)).await;
    }

    // ------------------------------------------------------------------------
    // Outbound RPCs
    //
    // Every exchange feeds the routing table: a response registers the peer,
    // a failure starts the replacement protocol. The transport enforces the
    // RPC deadline.
    // ------------------------------------------------------------------------

    /// Ping an address and register whoever answers.
    pub async fn ping_addr(&self, addr: SocketAddr) -> Result<Contact> {
        let id = self.network.ping(addr).await?;
        let contact = Contact::new(id, addr);
        self.observe_contact(contact).await;
        Ok(contact)
    }

    pub async fn rpc_find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let result = self.network.find_node(to, target).await;
        self.record_outcome(to, &result).await;
        result
    }

    pub async fn rpc_find_value(&self, to: &Contact, key: Key) -> Result<FindValueResult> {
        let result = self.network.find_value(to, key).await;
        self.record_outcome(to, &result).await;
        result
    }

    pub async fn rpc_store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        let result = self.network.store(to, key, value).await;
        self.record_outcome(to, &result).await;
        result
    }

    async fn record_outcome<T>(&self, peer: &Contact, result: &Result<T>) {
        match result {
            Ok(_) => self.observe_contact(*peer).await,
            Err(e) if e.downcast_ref::<DhtError>().is_some_and(DhtError::is_local) => {
                debug!(peer = %peer.addr, error = %e, "call failed locally, peer kept");
            }
            Err(_) => self.contact_failed(*peer).await,
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub async fn iterative_find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        crawler::find_node(self, target, Vec::new()).await
    }

    /// Node lookup seeded with contacts that may not be in the table yet.
    pub async fn iterative_find_node_from(
        &self,
        target: NodeId,
        seeds: Vec<Contact>,
    ) -> Result<Vec<Contact>> {
        crawler::find_node(self, target, seeds).await
    }

    pub async fn iterative_find_value(&self, key: Key) -> Result<Option<Vec<u8>>> {
        crawler::find_value(self, key).await
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    pub async fn get_local(&self, key: &Key) -> Option<Vec<u8>> {
        self.request(|tx| Command::GetLocal(*key, tx))
            .await
            .unwrap_or(None)
    }

    pub async fn store_local(&self, key: Key, value: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::StoreLocal(key, value)).await;
    }

    /// Replicate `value` to the k closest nodes to `key`.
    ///
    /// Fails with [`DhtError::NoRedundancy`] when no remote node accepts the
    /// value; nothing is written locally in that case. Returns the number of
    /// nodes that acknowledged the STORE.
    pub async fn put(&self, key: Key, value: Vec<u8>) -> Result<usize> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(DhtError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            }
            .into());
        }

        let target = NodeId::from(key);
        if self.find_neighbors(target, self.config.k).await.is_empty() {
            warn!(
                key = hex::encode(&key[..8]),
                "no known neighbors to store key on"
            );
            return Err(DhtError::NoRedundancy.into());
        }

        let nodes = self.iterative_find_node(target).await?;

        let mut join_set = JoinSet::new();
        for contact in nodes.iter().copied() {
            let this = self.clone();
            let value = value.clone();
            join_set.spawn(async move { this.rpc_store(&contact, key, value).await.is_ok() });
        }

        let mut stored = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok(true) = joined {
                stored += 1;
            }
        }

        if stored == 0 {
            warn!(
                key = hex::encode(&key[..8]),
                candidates = nodes.len(),
                "store reached no live nodes"
            );
            return Err(DhtError::NoRedundancy.into());
        }

        let local_distance = self.id().xor_distance(&target);
        let farthest = nodes
            .iter()
            .map(|c| c.distance_to(&target))
            .max_by(distance_cmp);
        if let Some(farthest) = farthest
            && distance_cmp(&local_distance, &farthest).is_lt()
        {
            self.store_local(key, value).await;
        }

        debug!(
            key = hex::encode(&key[..8]),
            stored,
            candidates = nodes.len(),
            "value replicated"
        );
        Ok(stored)
    }

    pub async fn get(&self, key: Key) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.get_local(&key).await {
            return Ok(Some(value));
        }
        if self.find_neighbors(NodeId::from(key), 1).await.is_empty() {
            warn!(
                key = hex::encode(&key[..8]),
                "no known neighbors to get key from"
            );
            return Ok(None);
        }
        self.iterative_find_value(key).await
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Look up a random id in every stale bucket, re-store aged entries and
    /// purge expired ones.
    pub async fn refresh_table(&self, force: bool) -> Result<()> {
        let stale_after = self.config.bucket_stale_after();
        let ids = self
            .request(|tx| Command::GetRefreshIds(stale_after, force, tx))
            .await?;

        if !ids.is_empty() {
            debug!(count = ids.len(), force, "refreshing stale routing buckets");
        }

        let mut join_set = JoinSet::new();
        for id in ids {
            let this = self.clone();
            join_set.spawn(async move {
                if let Err(e) = this.iterative_find_node(id).await {
                    debug!(id = ?hex::encode(&id.as_bytes()[..8]), error = ?e, "bucket refresh lookup failed");
                }
                let _ = this.cmd_tx.send(Command::MarkBucketRefreshed(id)).await;
            });
        }
        while join_set.join_next().await.is_some() {}

        if let Some(age) = self.config.republish_after() {
            let aged = self.request(|tx| Command::GetAgedEntries(age, tx)).await?;
            for (key, value) in aged {
                if let Err(e) = self.put(key, value).await {
                    debug!(key = hex::encode(&key[..8]), error = %e, "republish failed");
                }
            }
        }

        let _ = self.cmd_tx.send(Command::RemoveExpired).await;
        Ok(())
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => {
                    self.handle_observe_contact(contact);
                }
                Command::ContactFailed(contact) => {
                    self.handle_contact_failed(contact);
                }
                Command::StoreLocal(key, value) => {
                    self.storage.set(key, value, self.value_ttl);
                }
                Command::FindNeighbors(target, count, reply) => {
                    let _ = reply.send(self.routing.find_neighbors(&target, None, count));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.storage.get(&key));
                }
                Command::GetStats(reply) => {
                    let _ = reply.send(NodeStats {
                        contacts: self.routing.len(),
                        buckets: self.routing.buckets().len(),
                        stored_keys: self.storage.len(),
                    });
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.handle_observe_contact(from);
                    let closest = self.routing.find_neighbors(&target, Some(&from), self.k);
                    let _ = reply.send(closest);
                }
                Command::HandleFindValue(from, key, reply) => {
                    self.handle_observe_contact(from);
                    let result = match self.storage.get(&key) {
                        Some(value) => FindValueResult::Value(value),
                        None => FindValueResult::Nodes(self.routing.find_neighbors(
                            &NodeId::from(key),
                            Some(&from),
                            self.k,
                        )),
                    };
                    let _ = reply.send(result);
                }
                Command::HandleStore(from, key, value) => {
                    self.handle_observe_contact(from);
                    if value.len() > MAX_VALUE_SIZE {
                        warn!(
                            from = ?hex::encode(&from.id.as_bytes()[..8]),
                            size = value.len(),
                            max = MAX_VALUE_SIZE,
                            "rejecting oversized STORE"
                        );
                    } else {
                        self.storage.set(key, value, self.value_ttl);
                    }
                }
                Command::GetRefreshIds(stale_after, force, reply) => {
                    let _ = reply.send(self.routing.refresh_list(stale_after, force));
                }
                Command::MarkBucketRefreshed(id) => {
                    self.routing.mark_bucket_refreshed(&id);
                }
                Command::GetAgedEntries(age, reply) => {
                    let _ = reply.send(self.storage.iter_older_than(age));
                }
                Command::RemoveExpired => {
                    let removed = self.storage.remove_expired();
                    if removed > 0 {
                        debug!(removed, "purged expired entries");
                    }
                }
                Command::ApplyPingResult { head, alive } => {
                    self.pending_pings.remove(&head.id);
                    if alive {
                        self.routing.refresh_contact(&head.id);
                    } else if self.routing.remove_contact(&head.id) {
                        debug!(
                            peer = ?hex::encode(&head.id.as_bytes()[..8]),
                            "evicted unresponsive bucket head"
                        );
                    }
                }
                Command::ApplyReplacementPing { failed, candidate, alive } => {
                    self.pending_pings.remove(&candidate.id);
                    if alive {
                        if self.routing.replace_contact(&failed.id, &candidate) {
                            debug!(
                                failed = ?hex::encode(&failed.id.as_bytes()[..8]),
                                replacement = ?hex::encode(&candidate.id.as_bytes()[..8]),
                                "replaced failed contact"
                            );
                        }
                    } else {
                        self.routing.drop_replacement(&candidate.id);
                    }
                }
                Command::Quit => {
                    debug!("DhtNode actor shutting down");
                    break;
                }
            }
        }
    }

    fn handle_observe_contact(&mut self, contact: Contact) {
        if contact.id == self.local.id {
            return;
        }

        if self.routing.is_new_node(&contact.id) {
            self.welcome_new_node(contact);
        }

        if let InsertOutcome::Full { head } = self.routing.add_contact(contact) {
            self.spawn_liveness_ping(head, move |alive| Command::ApplyPingResult { head, alive });
        }
    }

    /// Push the values a newcomer should now hold, before it enters the table.
    fn welcome_new_node(&mut self, contact: Contact) {
        let mut transfers = Vec::new();
        for (key, value) in self.storage.entries() {
            let key_id = NodeId::from(key);
            let neighbors = self.routing.find_neighbors(&key_id, None, self.k);
            let should_send = match (neighbors.first(), neighbors.last()) {
                (Some(nearest), Some(farthest)) => {
                    let newcomer_closer =
                        distance_cmp(&contact.distance_to(&key_id), &farthest.distance_to(&key_id))
                            .is_lt();
                    let we_are_closest =
                        distance_cmp(&self.local.distance_to(&key_id), &nearest.distance_to(&key_id))
                            .is_lt();
                    newcomer_closer && we_are_closest
                }
                _ => true,
            };
            if should_send {
                transfers.push((key, value));
            }
        }

        if transfers.is_empty() {
            return;
        }

        trace!(
            peer = ?hex::encode(&contact.id.as_bytes()[..8]),
            keys = transfers.len(),
            "welcoming new node with stored values"
        );
        let network = self.network.clone();
        tokio::spawn(async move {
            for (key, value) in transfers {
                if let Err(e) = network.store(&contact, key, value).await {
                    debug!(
                        peer = ?hex::encode(&contact.id.as_bytes()[..8]),
                        error = %e,
                        "welcome store failed"
                    );
                    break;
                }
            }
        });
    }

    fn handle_contact_failed(&mut self, contact: Contact) {
        if !self.routing.contains(&contact.id) {
            // Possibly only cached; forget it there.
            self.routing.remove_contact(&contact.id);
            return;
        }

        match self.routing.replacement_candidate(&contact.id) {
            None => {
                self.routing.remove_contact(&contact.id);
                debug!(
                    peer = ?hex::encode(&contact.id.as_bytes()[..8]),
                    "removed unresponsive contact"
                );
            }
            Some(candidate) => {
                let failed = contact;
                self.spawn_liveness_ping(candidate, move |alive| Command::ApplyReplacementPing {
                    failed,
                    candidate,
                    alive,
                });
            }
        }
    }

    fn spawn_liveness_ping(
        &mut self,
        target: Contact,
        into_command: impl FnOnce(bool) -> Command + Send + 'static,
    ) {
        let Some(tx) = self.cmd_tx.upgrade() else {
            return;
        };
        if !self.pending_pings.insert(target.id) {
            return;
        }
        let network = self.network.clone();
        tokio::spawn(async move {
            let alive = matches!(network.ping(target.addr).await, Ok(id) if id == target.id);
            let _ = tx.send(into_command(alive)).await;
        });
    }
}
