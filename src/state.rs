//! Persisted node state: identity, parameters and known peers.
//!
//! Only what a restart needs to rejoin the network is saved. The routing
//! table and stored values are rebuilt from the network.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::DhtError;
use crate::identity::{ID_LEN, NodeId};

pub const STATE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    #[serde(with = "hex::serde")]
    pub id: [u8; ID_LEN],
    pub k: usize,
    pub alpha: usize,
    pub neighbors: Vec<SocketAddr>,
}

impl PersistedState {
    pub fn new(id: NodeId, k: usize, alpha: usize, neighbors: Vec<SocketAddr>) -> Self {
        Self {
            version: STATE_VERSION,
            id: *id.as_bytes(),
            k,
            alpha,
            neighbors,
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.id)
    }

    /// Write as JSON, replacing the file atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("failed to encode state")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write state {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to move state into {}", path.display()))?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .await
            .with_context(|| format!("failed to read state {}", path.display()))?;
        let state: PersistedState = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid state file {}", path.display()))?;
        if state.version != STATE_VERSION {
            return Err(DhtError::UnsupportedStateVersion {
                found: state.version,
                expected: STATE_VERSION,
            }
            .into());
        }
        Ok(state)
    }
}
