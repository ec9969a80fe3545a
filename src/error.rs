//! Error taxonomy surfaced by the DHT.
//!
//! Public operations return `anyhow::Result`; the variants here are the
//! root causes callers can match with `err.downcast_ref::<DhtError>()`.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    /// A peer did not answer within the RPC deadline.
    #[error("rpc to {addr} timed out")]
    Timeout { addr: SocketAddr },

    /// A store found no live node to replicate to.
    #[error("no reachable peers to store the value on")]
    NoRedundancy,

    /// A datagram could not be decoded or answered the wrong request.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// None of the seed addresses answered a ping.
    #[error("none of the {attempted} bootstrap seeds responded")]
    BootstrapFailed { attempted: usize },

    #[error("value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },

    #[error("unsupported state file version {found} (expected {expected})")]
    UnsupportedStateVersion { found: u32, expected: u32 },

    /// Too many calls are in flight locally; the peer was never asked.
    #[error("too many outstanding calls")]
    Overloaded,

    /// The node's actor or socket task has stopped.
    #[error("dht node is shut down")]
    Shutdown,
}

impl DhtError {
    /// Whether the failure lies with this node rather than the peer.
    pub fn is_local(&self) -> bool {
        matches!(self, DhtError::Overloaded | DhtError::Shutdown)
    }
}
