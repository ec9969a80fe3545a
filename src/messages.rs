//! # Wire Protocol Messages
//!
//! Every datagram is one bincode-encoded [`Envelope`]: a format version,
//! a random 20-byte correlation id, the sender's node id, and either a
//! request or a response. Responses echo the request's correlation id.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong` |
//! | `Store { key, value }` | `Stored` |
//! | `FindNode { target }` | `Nodes(contacts)` |
//! | `FindValue { key }` | `Value(bytes)` or `Nodes(contacts)` |
//!
//! ## Limits
//!
//! - `MAX_DATAGRAM_SIZE`: upper bound on an encoded envelope (8 KiB)
//! - `MAX_VALUE_SIZE`: largest storable value, leaving room for framing
//! - All decoding goes through `deserialize_bounded()`

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Contact, ID_LEN, Key, NodeId};

/// Current envelope format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum size of one encoded datagram.
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// Maximum size of a stored value.
/// One KiB below the datagram bound to leave room for the envelope.
pub const MAX_VALUE_SIZE: usize = MAX_DATAGRAM_SIZE - 1024;

/// Maximum contacts accepted in a single `Nodes` response.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 64;

/// Correlation id for an outstanding call.
pub type RpcId = [u8; ID_LEN];

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(envelope)
}

pub fn decode_envelope(data: &[u8]) -> Result<Envelope, bincode::Error> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }
    deserialize_bounded(data)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub rpc_id: RpcId,
    pub sender: NodeId,
    pub body: Body,
}

impl Envelope {
    pub fn request(rpc_id: RpcId, sender: NodeId, request: DhtRequest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            rpc_id,
            sender,
            body: Body::Request(request),
        }
    }

    pub fn response(rpc_id: RpcId, sender: NodeId, response: DhtResponse) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            rpc_id,
            sender,
            body: Body::Response(response),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Body {
    Request(DhtRequest),
    Response(DhtResponse),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    Store { key: Key, value: Vec<u8> },
    FindNode { target: NodeId },
    FindValue { key: Key },
}

impl DhtRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "PING",
            DhtRequest::Store { .. } => "STORE",
            DhtRequest::FindNode { .. } => "FIND_NODE",
            DhtRequest::FindValue { .. } => "FIND_VALUE",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong,
    Stored,
    Nodes(Vec<Contact>),
    Value(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn envelope_keeps_correlation_and_payload() {
        let sender = NodeId::random();
        let rpc_id: RpcId = rand::random();
        let contacts: Vec<Contact> = (0..20u16)
            .map(|i| Contact::new(NodeId::random(), SocketAddr::from((Ipv4Addr::LOCALHOST, 4000 + i))))
            .collect();
        let envelope = Envelope::response(rpc_id, sender, DhtResponse::Nodes(contacts.clone()));

        let bytes = encode_envelope(&envelope).unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.rpc_id, rpc_id);
        assert_eq!(decoded.sender, sender);
        match decoded.body {
            Body::Response(DhtResponse::Nodes(nodes)) => assert_eq!(nodes, contacts),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn max_size_value_fits_in_a_datagram() {
        let envelope = Envelope::request(
            rand::random(),
            NodeId::random(),
            DhtRequest::Store {
                key: [7u8; ID_LEN],
                value: vec![0xAB; MAX_VALUE_SIZE],
            },
        );
        let bytes = encode_envelope(&envelope).unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn garbage_and_oversized_input_is_rejected() {
        assert!(decode_envelope(&[0xff; 7]).is_err());
        assert!(decode_envelope(&vec![0u8; MAX_DATAGRAM_SIZE + 1]).is_err());
    }

    #[test]
    fn request_kinds_are_named() {
        assert_eq!(DhtRequest::Ping.kind(), "PING");
        assert_eq!(DhtRequest::FindNode { target: NodeId::random() }.kind(), "FIND_NODE");
    }
}
