//! # High-Level Server API
//!
//! A [`Server`] is one DHT participant bound to a UDP socket. It wires the
//! components together and exposes the operations applications use:
//!
//! ```ignore
//! let server = Server::listen("0.0.0.0:8468".parse()?, DhtConfig::default()).await?;
//! server.bootstrap(&["203.0.113.7:8468".parse()?]).await?;
//!
//! server.set(b"greeting", b"hello".to_vec()).await?;
//! let value = server.get(b"greeting").await?;
//! ```
//!
//! ## Component Integration
//!
//! - **RpcNode**: UDP socket, call correlation and timeouts
//! - **DhtNode**: routing table, storage and lookups
//! - Background tasks: the receive loop, the periodic table refresh and an
//!   optional periodic state saver
//!
//! Keys given to [`Server::get`] and [`Server::set`] are arbitrary bytes,
//! digested to 160 bits. Use the `_digest` variants to address a key that
//! is already an id.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::dht::{DhtNode, NodeStats};
use crate::error::DhtError;
use crate::identity::{Contact, Key, NodeId};
use crate::rpc::{self, RpcNode};
use crate::state::PersistedState;
use crate::storage::{MemoryStorage, Storage};

pub struct Server {
    config: DhtConfig,
    contact: Contact,
    dhtnode: DhtNode<RpcNode>,
    rpcnode: RpcNode,
    listener: JoinHandle<Result<()>>,
    refresher: JoinHandle<()>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind a new node with a random id.
    pub async fn listen(addr: SocketAddr, config: DhtConfig) -> Result<Self> {
        Self::listen_with_id(addr, NodeId::random(), config).await
    }

    pub async fn listen_with_id(addr: SocketAddr, id: NodeId, config: DhtConfig) -> Result<Self> {
        Self::listen_with_storage(addr, id, config, MemoryStorage::new()).await
    }

    /// Bind a node that keeps its values in `storage`.
    pub async fn listen_with_storage(
        addr: SocketAddr,
        id: NodeId,
        config: DhtConfig,
        storage: impl Storage,
    ) -> Result<Self> {
        config.validate()?;

        let rpcnode = RpcNode::bind(addr, id, config.rpc_timeout()).await?;
        let local_addr = rpcnode.local_addr()?;
        let contact = Contact::new(id, local_addr);
        let dhtnode = DhtNode::with_storage(contact, rpcnode.clone(), config.clone(), storage);

        let listener = tokio::spawn(rpc::serve(rpcnode.clone(), dhtnode.clone()));
        let refresher = spawn_refresh_loop(dhtnode.clone(), config.refresh_interval());

        info!(
            id = %id,
            addr = %local_addr,
            k = config.k,
            alpha = config.alpha,
            "dht node listening"
        );

        Ok(Self {
            config,
            contact,
            dhtnode,
            rpcnode,
            listener,
            refresher,
            saver: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.contact.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.contact.addr
    }

    pub fn contact(&self) -> Contact {
        self.contact
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Join a network through the given seed addresses.
    ///
    /// Every seed is pinged; those that answer seed a lookup for the local
    /// id. Fails with [`DhtError::BootstrapFailed`] when none answer, which
    /// leaves the node usable as the first member of a new network.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<Vec<Contact>> {
        let mut join_set = JoinSet::new();
        for addr in seeds.iter().copied() {
            let dhtnode = self.dhtnode.clone();
            join_set.spawn(async move { (addr, dhtnode.ping_addr(addr).await) });
        }

        let mut responders = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((addr, result)) = joined else { continue };
            match result {
                Ok(contact) if contact.id != self.contact.id => responders.push(contact),
                Ok(_) => debug!(%addr, "bootstrap seed is this node, skipping"),
                Err(e) => debug!(%addr, error = %e, "bootstrap seed did not respond"),
            }
        }

        if responders.is_empty() {
            warn!(seeds = seeds.len(), "no bootstrap seed responded");
            return Err(DhtError::BootstrapFailed {
                attempted: seeds.len(),
            }
            .into());
        }

        let found = self
            .dhtnode
            .iterative_find_node_from(self.contact.id, responders.clone())
            .await?;
        info!(
            seeds = seeds.len(),
            responded = responders.len(),
            found = found.len(),
            "bootstrap complete"
        );
        Ok(found)
    }

    /// Value stored under `key`, digested to an id first.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_digest(*NodeId::digest(key).as_bytes()).await
    }

    pub async fn get_digest(&self, key: Key) -> Result<Option<Vec<u8>>> {
        self.dhtnode.get(key).await
    }

    /// Store `value` under `key` on the k closest nodes.
    ///
    /// Fails with [`DhtError::NoRedundancy`] if no remote node took the value.
    pub async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.set_digest(*NodeId::digest(key).as_bytes(), value).await
    }

    pub async fn set_digest(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.dhtnode.put(key, value).await.map(|_| ())
    }

    /// Addresses worth bootstrapping from on a later run.
    pub async fn bootstrappable_neighbors(&self) -> Vec<SocketAddr> {
        neighbor_addrs(&self.dhtnode, self.config.k).await
    }

    // =========================================================================
    // Persisted State
    // =========================================================================

    /// Write the node id, parameters and known neighbors to `path`.
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state = snapshot(&self.dhtnode, &self.config).await;
        state.save(path).await?;
        info!(
            path = %path.display(),
            neighbors = state.neighbors.len(),
            "saved node state"
        );
        Ok(())
    }

    /// Start a node from a saved state file and rejoin its saved neighbors.
    ///
    /// The saved `k` and `alpha` override those in `config`. A failed
    /// bootstrap is logged; the node is returned either way.
    pub async fn load_state(
        path: impl AsRef<Path>,
        addr: SocketAddr,
        config: DhtConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let state = PersistedState::load(path).await?;
        let config = DhtConfig {
            k: state.k,
            alpha: state.alpha,
            ..config
        };

        let server = Self::listen_with_id(addr, state.node_id(), config).await?;
        info!(
            path = %path.display(),
            neighbors = state.neighbors.len(),
            "restored node state"
        );
        if !state.neighbors.is_empty()
            && let Err(e) = server.bootstrap(&state.neighbors).await
        {
            warn!(error = %e, "could not rejoin saved neighbors");
        }
        Ok(server)
    }

    /// Save state to `path` every `interval` until shutdown.
    pub fn save_state_regularly(&self, path: impl Into<PathBuf>, interval: Duration) {
        let path = path.into();
        let interval = interval.max(Duration::from_millis(1));
        let dhtnode = self.dhtnode.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip initial tick
            loop {
                ticker.tick().await;
                let state = snapshot(&dhtnode, &config).await;
                match state.save(&path).await {
                    Ok(()) => debug!(path = %path.display(), "saved node state"),
                    Err(e) => warn!(path = %path.display(), error = %e, "periodic state save failed"),
                }
            }
        });

        if let Ok(mut saver) = self.saver.lock()
            && let Some(previous) = saver.replace(handle)
        {
            previous.abort();
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn stats(&self) -> NodeStats {
        self.dhtnode.stats().await
    }

    /// Run one table refresh immediately, treating every bucket as stale
    /// when `force` is set.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        self.dhtnode.refresh_table(force).await
    }

    pub async fn shutdown(&self) {
        self.abort_tasks();
        self.dhtnode.quit().await;
        self.rpcnode.quit().await;
        info!(id = %self.contact.id, "dht node stopped");
    }

    fn abort_tasks(&self) {
        self.listener.abort();
        self.refresher.abort();
        if let Ok(mut saver) = self.saver.lock()
            && let Some(handle) = saver.take()
        {
            handle.abort();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn spawn_refresh_loop(dhtnode: DhtNode<RpcNode>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // Skip initial tick
        loop {
            ticker.tick().await;
            if let Err(e) = dhtnode.refresh_table(false).await {
                debug!(error = %e, "table refresh stopped");
                break;
            }
        }
    })
}

async fn neighbor_addrs(dhtnode: &DhtNode<RpcNode>, k: usize) -> Vec<SocketAddr> {
    dhtnode
        .find_neighbors(dhtnode.id(), k)
        .await
        .into_iter()
        .map(|contact| contact.addr)
        .collect()
}

async fn snapshot(dhtnode: &DhtNode<RpcNode>, config: &DhtConfig) -> PersistedState {
    PersistedState::new(
        dhtnode.id(),
        config.k,
        config.alpha,
        neighbor_addrs(dhtnode, config.k).await,
    )
}
