//! Node configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::routing::DEFAULT_K;
use crate::storage::MAX_TTL;

/// Default Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

/// Default per-RPC deadline in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;

/// Default bound on lookup rounds.
pub const DEFAULT_MAX_LOOKUP_ROUNDS: usize = 20;

/// Longest accepted RPC deadline (one hour).
pub const MAX_RPC_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// DHT node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket size and replication factor
    pub k: usize,
    /// Parallel queries per lookup round
    pub alpha: usize,
    /// Deadline for a single RPC in milliseconds
    pub rpc_timeout_ms: u64,
    /// Lifetime of a stored value in seconds
    pub value_ttl_secs: u64,
    /// Interval between routing table refreshes in seconds
    pub refresh_interval_secs: u64,
    /// Buckets untouched for this long are refreshed
    pub bucket_stale_secs: u64,
    /// Re-store local entries older than this on every refresh; `None` disables it
    pub republish_after_secs: Option<u64>,
    /// Upper bound on rounds of a single iterative lookup
    pub max_lookup_rounds: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            value_ttl_secs: 7 * 24 * 60 * 60,
            refresh_interval_secs: 60 * 60,
            bucket_stale_secs: 60 * 60,
            republish_after_secs: Some(60 * 60),
            max_lookup_rounds: DEFAULT_MAX_LOOKUP_ROUNDS,
        }
    }
}

impl DhtConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: DhtConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn value_ttl(&self) -> Duration {
        Duration::from_secs(self.value_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn bucket_stale_after(&self) -> Duration {
        Duration::from_secs(self.bucket_stale_secs)
    }

    pub fn republish_after(&self) -> Option<Duration> {
        self.republish_after_secs.map(Duration::from_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            bail!("k must be > 0");
        }
        if self.alpha == 0 {
            bail!("alpha must be > 0");
        }
        if self.rpc_timeout_ms == 0 {
            bail!("rpc_timeout_ms must be > 0");
        }
        if self.rpc_timeout_ms > MAX_RPC_TIMEOUT_MS {
            bail!("rpc_timeout_ms must be <= {MAX_RPC_TIMEOUT_MS}");
        }
        if self.value_ttl_secs > MAX_TTL.as_secs() {
            bail!("value_ttl_secs must be <= {}", MAX_TTL.as_secs());
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be > 0");
        }
        if self.max_lookup_rounds == 0 {
            bail!("max_lookup_rounds must be > 0");
        }
        Ok(())
    }
}
