//! Protocol trait definitions.
//!
//! [`DhtNodeRpc`] is the seam between the Kademlia engine and the
//! transport. The engine (`dht`, `crawler`) only sees this trait; the UDP
//! implementation lives in `rpc`, and tests plug in an in-process network.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Contact, Key, NodeId};

/// Answer to a FIND_VALUE query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResult {
    /// The responder holds the value.
    Value(Vec<u8>),
    /// The responder does not; these are its closest contacts to the key.
    Nodes(Vec<Contact>),
}

/// DHT node operations for distributed routing and storage.
///
/// Implementations enforce the RPC deadline themselves and report an
/// unanswered call as [`DhtError::Timeout`](crate::DhtError::Timeout).
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Ping an address, returning the id of the node that answered.
    async fn ping(&self, addr: SocketAddr) -> Result<NodeId>;

    /// Store a key-value pair on a remote node.
    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()>;

    /// Find the k closest nodes to a target id.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Find a value by key, or the closest nodes to it.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResult>;
}
