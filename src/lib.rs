//! # kadnet - Kademlia Distributed Hash Table
//!
//! kadnet is a peer-to-peer key/value store. Nodes organize themselves by
//! the XOR distance between 160-bit ids and locate the nodes closest to any
//! key in O(log n) hops, without a central coordinator.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for shared state:
//! - The DHT and the RPC layer each have a public Handle and private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially, so the
//!   routing table has a single writer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `server` | High-level API: listen, bootstrap, get/set, persisted state |
//! | `identity` | 160-bit ids, XOR distance, contacts |
//! | `routing` | K-buckets with replacement caches, the routing table |
//! | `storage` | Storage trait and the bounded in-memory backend |
//! | `dht` | DHT actor: table upkeep, RPC handlers, put/get |
//! | `crawler` | Iterative node and value lookups |
//! | `protocols` | Protocol trait definitions (DhtNodeRpc) |
//! | `rpc` | UDP RPC layer implementing protocols |
//! | `messages` | Wire format |
//! | `state` | Persisted id and neighbor list |
//! | `config` | Tunable parameters |
//! | `error` | Error taxonomy |

mod config;
mod crawler;
mod dht;
mod error;
mod identity;
mod messages;
mod protocols;
mod routing;
mod rpc;
mod server;
mod state;
mod storage;

#[cfg(test)]
mod test_support;

pub use config::{DEFAULT_ALPHA, DhtConfig};
pub use dht::NodeStats;
pub use error::DhtError;
pub use identity::{Contact, ID_LEN, Key, NodeId};
pub use messages::MAX_VALUE_SIZE;
pub use routing::DEFAULT_K;
pub use server::Server;
pub use state::{PersistedState, STATE_VERSION};
pub use storage::{DEFAULT_TTL, MemoryStorage, Storage};
