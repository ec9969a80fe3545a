//! # Node Identity
//!
//! Every participant is named by a 160-bit [`NodeId`]. Distances between
//! identifiers use the Kademlia XOR metric: `distance(a, b) = a XOR b`,
//! compared as an unsigned big-endian integer (see [`distance_cmp`]).
//!
//! Stored keys live in the same 160-bit space. Application keys of any
//! length are mapped into it with [`NodeId::digest`].

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Length of a node identifier in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Length of a node identifier in bits.
pub const ID_BITS: usize = ID_LEN * 8;

/// Key type for DHT storage (a digested 160-bit key).
pub type Key = [u8; ID_LEN];

/// XOR distance between two identifiers.
pub type Distance = [u8; ID_LEN];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Map arbitrary key bytes into the identifier space.
    ///
    /// BLAKE3 output truncated to 160 bits, so ids are uniformly
    /// distributed and the XOR metric behaves as intended.
    pub fn digest(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&hash.as_bytes()[..ID_LEN]);
        Self(out)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Value of bit `index` counting from the most significant bit.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Number of leading bits shared with `other`.
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        leading_zero_bits(&self.xor_distance(other))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl From<Key> for NodeId {
    fn from(key: Key) -> Self {
        Self(key)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Count leading zero bits of a big-endian byte string.
pub(crate) fn leading_zero_bits(bytes: &[u8]) -> usize {
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return idx * 8 + byte.leading_zeros() as usize;
        }
    }
    bytes.len() * 8
}

/// Compare two distances as unsigned big-endian integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    for i in 0..ID_LEN {
        if a[i] < b[i] {
            return Ordering::Less;
        } else if a[i] > b[i] {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// A reachable peer: identifier plus the UDP address it answers on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    #[inline]
    pub fn distance_to(&self, target: &NodeId) -> Distance {
        self.id.xor_distance(target)
    }

    /// Same network endpoint, regardless of id.
    pub fn same_home_as(&self, other: &Contact) -> bool {
        self.addr == other.addr
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}
