//! # Wire Messages
//!
//! Every UDP datagram carries one bincode-encoded [`Envelope`]:
//!
//! | Variant | Purpose |
//! |---------|---------|
//! | `Request` / `Response` | DHT RPC, correlated by request id |
//! | `Overlay` | subscription announcements and gossip publishes |
//! | `Datagram` | opaque payloads for the stream layer |
//!
//! Decoding is always size-bounded through [`decode_envelope`] and
//! [`deserialize_bounded`].

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::dht::{Key, ValueRecord};
use crate::error::Result;
use crate::identity::{Identity, PeerAddress};

/// Maximum size of a stored DHT value.
pub const MAX_VALUE_SIZE: usize = 8 * 1024;

/// Largest datagram accepted or produced by the UDP backend.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Deserialization limit. Nothing larger fits in a datagram.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_DATAGRAM_SIZE as u64;

/// 32-byte gossip message id.
pub type MessageId = [u8; 32];

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options().deserialize(bytes)?)
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(envelope)?)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    deserialize_bounded(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Envelope {
    Request {
        id: u64,
        from: PeerAddress,
        body: DhtRequest,
    },
    Response {
        id: u64,
        from: PeerAddress,
        body: DhtResponse,
    },
    Overlay {
        from: PeerAddress,
        body: OverlayMessage,
    },
    Datagram {
        from: PeerAddress,
        payload: Vec<u8>,
    },
}

impl Envelope {
    pub fn sender(&self) -> &PeerAddress {
        match self {
            Envelope::Request { from, .. }
            | Envelope::Response { from, .. }
            | Envelope::Overlay { from, .. }
            | Envelope::Datagram { from, .. } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: Identity },
    FindValue { key: Key },
    Store { key: Key, record: ValueRecord },
    /// The sender announces itself as a provider for `key`.
    AddProvider { key: Key },
    GetProviders { key: Key },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong,
    Ack,
    Nodes(Vec<PeerAddress>),
    Value {
        record: Option<ValueRecord>,
        closer: Vec<PeerAddress>,
    },
    Providers {
        providers: Vec<PeerAddress>,
        closer: Vec<PeerAddress>,
    },
    Rejected(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// The sender's complete current topic set. Replaces any earlier announcement.
    Announce { topics: Vec<String> },
    Publish(GossipPublish),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPublish {
    pub source: Identity,
    pub seqno: u64,
    pub topic: String,
    pub data: Vec<u8>,
}

impl GossipPublish {
    /// `blake3(source || seqno || topic || data)`.
    pub fn id(&self) -> MessageId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_bytes());
        hasher.update(&self.seqno.to_be_bytes());
        hasher.update(&(self.topic.len() as u32).to_be_bytes());
        hasher.update(self.topic.as_bytes());
        hasher.update(&self.data);
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;
    use crate::identity::Keypair;

    fn peer() -> PeerAddress {
        PeerAddress::new(Keypair::generate().identity(), "127.0.0.1:4000")
    }

    #[test]
    fn request_envelope_decodes() {
        let from = peer();
        let target = Keypair::generate().identity();
        let bytes = encode_envelope(&Envelope::Request {
            id: 9,
            from: from.clone(),
            body: DhtRequest::FindNode { target },
        })
        .unwrap();
        match decode_envelope(&bytes).unwrap() {
            Envelope::Request {
                id,
                from: decoded_from,
                body: DhtRequest::FindNode { target: t },
            } => {
                assert_eq!(id, 9);
                assert_eq!(decoded_from, from);
                assert_eq!(t, target);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(matches!(decode_envelope(&[]), Err(NetError::Codec(_))));
        assert!(matches!(decode_envelope(&[9, 0, 0, 0, 1]), Err(NetError::Codec(_))));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        // Datagram variant with a length prefix far above the limit.
        let mut bytes = encode_envelope(&Envelope::Datagram {
            from: peer(),
            payload: vec![1, 2, 3],
        })
        .unwrap();
        let len_pos = bytes.len() - 3 - 8;
        bytes[len_pos..len_pos + 8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        assert!(decode_envelope(&bytes).is_err());
    }

    #[test]
    fn message_id_binds_every_field() {
        let base = GossipPublish {
            source: Keypair::generate().identity(),
            seqno: 1,
            topic: "blocks".into(),
            data: b"hello".to_vec(),
        };
        let mut other = base.clone();
        other.seqno = 2;
        assert_ne!(base.id(), other.id());

        let mut other = base.clone();
        other.topic = "votes".into();
        assert_ne!(base.id(), other.id());

        let mut other = base.clone();
        other.data = b"hellp".to_vec();
        assert_ne!(base.id(), other.id());

        assert_eq!(base.id(), base.clone().id());
    }

    #[test]
    fn sender_accessor() {
        let from = peer();
        let env = Envelope::Overlay {
            from: from.clone(),
            body: OverlayMessage::Announce { topics: vec![] },
        };
        assert_eq!(env.sender(), &from);
    }
}
