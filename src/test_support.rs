//! In-process network used by the engine tests.
//!
//! Every [`TestNode`] registers its [`DhtNode`] in a shared
//! [`NetworkRegistry`]; RPCs are delivered by calling the peer's inbound
//! handlers directly. Failures can be injected per destination address.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{Mutex, RwLock};

use crate::config::DhtConfig;
use crate::dht::DhtNode;
use crate::error::DhtError;
use crate::identity::{Contact, Key, NodeId};
use crate::protocols::{DhtNodeRpc, FindValueResult};

pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout_ms: 500,
        ..DhtConfig::default()
    }
}

pub fn make_addr(index: u32) -> SocketAddr {
    let hi = ((index >> 8) & 0xFF) as u8;
    let lo = (index & 0xFF) as u8;
    SocketAddr::from(([10, 0, hi, lo], 9000))
}

#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    failures: Arc<Mutex<HashSet<SocketAddr>>>,
    overloaded: Arc<Mutex<bool>>,
    stores: Arc<Mutex<Vec<(Contact, Key)>>>,
    pings: Arc<Mutex<Vec<SocketAddr>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            failures: Arc::new(Mutex::new(HashSet::new())),
            overloaded: Arc::new(Mutex::new(false)),
            stores: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, addr: SocketAddr, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(addr);
        } else {
            failures.remove(&addr);
        }
    }

    /// Refuse every call locally, as a saturated transport would.
    pub async fn set_overloaded(&self, overloaded: bool) {
        *self.overloaded.lock().await = overloaded;
    }

    pub async fn store_calls(&self) -> Vec<(Contact, Key)> {
        self.stores.lock().await.clone()
    }

    pub async fn ping_calls(&self) -> Vec<SocketAddr> {
        self.pings.lock().await.clone()
    }

    async fn check(&self, addr: &SocketAddr) -> anyhow::Result<()> {
        if *self.overloaded.lock().await {
            return Err(DhtError::Overloaded.into());
        }
        if self.failures.lock().await.contains(addr) {
            return Err(DhtError::Timeout { addr: *addr }.into());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<SocketAddr, DhtNode<TestNetwork>>>,
}

impl NetworkRegistry {
    async fn register(&self, node: &DhtNode<TestNetwork>) {
        self.peers
            .write()
            .await
            .insert(node.contact().addr, node.clone());
    }

    async fn get(&self, addr: &SocketAddr) -> Option<DhtNode<TestNetwork>> {
        self.peers.read().await.get(addr).cloned()
    }
}

#[async_trait::async_trait]
impl DhtNodeRpc for TestNetwork {
    async fn ping(&self, addr: SocketAddr) -> anyhow::Result<NodeId> {
        self.pings.lock().await.push(addr);
        self.check(&addr).await?;
        let peer = self
            .registry
            .get(&addr)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        peer.handle_ping_request(&self.self_contact).await;
        Ok(peer.id())
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> anyhow::Result<()> {
        self.check(&to.addr).await?;
        self.stores.lock().await.push((*to, key));
        let peer = self
            .registry
            .get(&to.addr)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        peer.handle_store_request(&self.self_contact, key, value).await;
        Ok(())
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> anyhow::Result<Vec<Contact>> {
        self.check(&to.addr).await?;
        match self.registry.get(&to.addr).await {
            Some(peer) => Ok(peer.handle_find_node_request(&self.self_contact, target).await),
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> anyhow::Result<FindValueResult> {
        self.check(&to.addr).await?;
        match self.registry.get(&to.addr).await {
            Some(peer) => Ok(peer.handle_find_value_request(&self.self_contact, key).await),
            None => Err(anyhow!("peer not reachable")),
        }
    }
}

pub struct TestNode {
    pub node: DhtNode<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::with_id(registry, NodeId::random(), index, config).await
    }

    pub async fn with_id(
        registry: Arc<NetworkRegistry>,
        id: NodeId,
        index: u32,
        config: DhtConfig,
    ) -> Self {
        let contact = Contact::new(id, make_addr(index));
        let network = TestNetwork::new(registry.clone(), contact);
        let node = DhtNode::new(contact, network.clone(), config);
        registry.register(&node).await;
        Self { node, network }
    }

    /// `count` nodes joined through the first one, each having looked up
    /// its own id.
    pub async fn mesh(registry: Arc<NetworkRegistry>, count: u32, config: DhtConfig) -> Vec<Self> {
        let mut nodes = Vec::with_capacity(count as usize);
        for index in 1..=count {
            nodes.push(Self::new(registry.clone(), index, config.clone()).await);
        }
        let seed = nodes[0].contact();
        for node in &nodes[1..] {
            node.node.observe_contact(seed).await;
            let _ = node.node.iterative_find_node(node.contact().id).await;
        }
        nodes
    }

    pub fn contact(&self) -> Contact {
        self.node.contact()
    }
}
