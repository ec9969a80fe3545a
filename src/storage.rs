//! # Local Storage
//!
//! Key/value storage with per-entry expiration, behind the [`Storage`]
//! capability trait so a durable backend can replace [`MemoryStorage`]
//! without touching the protocol or crawler code.
//!
//! Expired entries are never returned. They are purged lazily on read and
//! by [`Storage::remove_expired`], which the refresh loop calls.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::Key;

/// Default time-to-live for stored entries (one week).
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest lifetime an entry can be given; longer TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Maximum number of entries held by [`MemoryStorage`].
/// The oldest insertion is dropped first once the bound is reached.
pub const MAX_STORED_ENTRIES: usize = 100_000;

/// Storage capability used by the DHT actor.
pub trait Storage: Send + 'static {
    /// Value for `key`, unless absent or expired.
    fn get(&mut self, key: &Key) -> Option<Vec<u8>>;

    /// Insert or overwrite `key`, resetting its expiration to `ttl` from now.
    fn set(&mut self, key: Key, value: Vec<u8>, ttl: Duration);

    /// Live entries stored at least `age` ago, oldest first.
    fn iter_older_than(&mut self, age: Duration) -> Vec<(Key, Vec<u8>)>;

    /// All live entries in insertion order.
    fn entries(&mut self) -> Vec<(Key, Vec<u8>)>;

    /// Drop expired entries, returning how many were removed.
    fn remove_expired(&mut self) -> usize;

    /// Number of entries currently held (may include not-yet-purged ones).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct StoredEntry {
    value: Vec<u8>,
    stored_at: Instant,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory [`Storage`], bounded and ordered by insertion time.
pub struct MemoryStorage {
    entries: LruCache<Key, StoredEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STORED_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&mut self, key: &Key) -> Option<Vec<u8>> {
        let now = Instant::now();
        // `peek` keeps insertion order intact.
        match self.entries.peek(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        self.entries.pop(key);
        trace!(key = hex::encode(&key[..8]), "dropped expired entry on read");
        None
    }

    fn set(&mut self, key: Key, value: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        // Pop first so an overwrite moves to the newest position.
        self.entries.pop(&key);
        self.entries.put(
            key,
            StoredEntry {
                value,
                stored_at: now,
                expires_at: now + ttl.min(MAX_TTL),
            },
        );
    }

    fn iter_older_than(&mut self, age: Duration) -> Vec<(Key, Vec<u8>)> {
        let now = Instant::now();
        self.entries
            .iter()
            .rev()
            .filter(|(_, entry)| !entry.is_expired(now))
            .take_while(|(_, entry)| now.duration_since(entry.stored_at) >= age)
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }

    fn entries(&mut self) -> Vec<(Key, Vec<u8>)> {
        let now = Instant::now();
        self.entries
            .iter()
            .rev()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }

    fn remove_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<Key> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
