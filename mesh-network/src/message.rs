//! Message types, canonical header encoding, and content hashing (§6).
//!
//! The canonical encoding is hand-rolled to a fixed byte layout rather than
//! handed to `bincode` directly: signing and content-hashing both need the
//! exact same bytes with the signature field zero-filled, and a
//! self-describing serde format would make that guarantee implicit instead
//! of explicit. `bincode` is still used for the opaque payload structures
//! relay hops don't need to interpret (see `UnicastEnvelope` below).

use mesh_crypto::{ContentHash, PublicKey, Signature};
use mesh_identity::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

pub const HEADER_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Text = 0,
    Voice = 1,
    FileMetadata = 2,
    FileChunk = 3,
    PeerDiscovery = 4,
    PeerIntroduction = 5,
    ControlPing = 6,
    ControlPong = 7,
    ControlAck = 8,
    DhtFindNode = 9,
    DhtFoundNodes = 10,
    DhtFindValue = 11,
    DhtFoundValue = 12,
    DhtStore = 13,
    RendezvousAnnounce = 14,
    RendezvousQuery = 15,
    RendezvousResponse = 16,
    RequestBlob = 17,
    ResponseBlob = 18,
    SessionPresence = 19,
    GossipDigest = 20,
    GossipPush = 21,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> MeshResult<Self> {
        use MessageType::*;
        Ok(match tag {
            0 => Text,
            1 => Voice,
            2 => FileMetadata,
            3 => FileChunk,
            4 => PeerDiscovery,
            5 => PeerIntroduction,
            6 => ControlPing,
            7 => ControlPong,
            8 => ControlAck,
            9 => DhtFindNode,
            10 => DhtFoundNodes,
            11 => DhtFindValue,
            12 => DhtFoundValue,
            13 => DhtStore,
            14 => RendezvousAnnounce,
            15 => RendezvousQuery,
            16 => RendezvousResponse,
            17 => RequestBlob,
            18 => ResponseBlob,
            19 => SessionPresence,
            20 => GossipDigest,
            21 => GossipPush,
            other => return Err(MeshError::UnknownMessageType(other)),
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// The broadcast set: messages not terminated at a single recipient.
    /// Session presence rides the broadcast set too, since single-session
    /// enforcement needs mesh-wide reach, not just the originator's direct
    /// neighbors.
    pub fn is_broadcast_type(self) -> bool {
        matches!(
            self,
            MessageType::PeerDiscovery
                | MessageType::PeerIntroduction
                | MessageType::ControlPing
                | MessageType::ControlPong
                | MessageType::SessionPresence
        )
    }

    /// DHT/gossip/control RPC types routed to a subsystem rather than the
    /// generic local-listener set.
    pub fn is_subsystem_rpc(self) -> bool {
        use MessageType::*;
        matches!(
            self,
            DhtFindNode
                | DhtFoundNodes
                | DhtFindValue
                | DhtFoundValue
                | DhtStore
                | ControlPing
                | ControlPong
                | ControlAck
                | RequestBlob
                | ResponseBlob
                | SessionPresence
                | GossipDigest
                | GossipPush
        )
    }

    /// Control messages are always forwarded regardless of payload
    /// inspection outcome.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::ControlPing | MessageType::ControlPong | MessageType::ControlAck
        )
    }
}

/// Fixed-order header: version, type, TTL, timestamp, sender pubkey,
/// signature (zeroed for hashing/signing), then an optional recipient
/// extension (see SPEC_FULL.md §12: recipient lives in the header so relay
/// hops never need to parse payload bytes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_pubkey: PublicKey,
    pub signature: Signature,
    pub recipient: Option<NodeId>,
}

impl Header {
    /// Encode with the signature field zero-filled, the sole input to
    /// signing and content hashing.
    fn encode_for_signing(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 1 + 1 + 8 + 32 + 64 + 33);
        out.push(self.version);
        out.push(self.msg_type.tag());
        out.push(self.ttl);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(self.sender_pubkey.as_bytes());
        out.extend_from_slice(&[0u8; mesh_crypto::SIGNATURE_LEN]);
        match &self.recipient {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(id.as_bytes());
            }
            None => out.push(0),
        }
        out
    }
}

/// A complete mesh message: header plus opaque payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Canonical bytes used for signing and content hashing: the header
    /// with signature zeroed, followed by the length-prefixed payload.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = self.header.encode_for_signing();
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn content_hash(&self) -> ContentHash {
        mesh_crypto::content_hash(&self.canonical_bytes())
    }

    pub fn sign(&mut self, keypair: &mesh_crypto::Keypair) {
        self.header.signature = Signature::zeroed();
        let bytes = self.canonical_bytes();
        self.header.signature = keypair.sign(&bytes);
    }

    pub fn verify(&self) -> bool {
        let mut unsigned = self.clone();
        let signature = self.header.signature;
        unsigned.header.signature = Signature::zeroed();
        let bytes = unsigned.canonical_bytes();
        mesh_crypto::verify(&self.header.sender_pubkey, &bytes, &signature)
    }

    /// Build a forwarded copy with `ttl := ttl - 1`. Caller must first
    /// check `ttl >= 1` (I3).
    pub fn forwarded(&self) -> Message {
        let mut next = self.clone();
        next.header.ttl -= 1;
        next
    }

    /// Recipient for a unicast message: header field if present, else a
    /// best-effort decode of a payload-carried envelope.
    pub fn recipient(&self) -> Option<NodeId> {
        if let Some(id) = self.header.recipient {
            return Some(id);
        }
        bincode::deserialize::<UnicastEnvelope>(&self.payload)
            .ok()
            .map(|env| env.recipient)
    }

    /// Wire encoding consumed by a Transport's `send`/`on_message`.
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MeshError::DecodeFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Message> {
        bincode::deserialize(bytes).map_err(|e| MeshError::DecodeFailed(e.to_string()))
    }
}

/// Structured payload record for unicast types: a `recipient` field plus
/// an arbitrary body. Relay inspects only `recipient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnicastEnvelope {
    pub recipient: NodeId,
    pub body: Vec<u8>,
}

impl UnicastEnvelope {
    pub fn encode(recipient: NodeId, body: Vec<u8>) -> Vec<u8> {
        bincode::serialize(&UnicastEnvelope { recipient, body }).expect("serialize is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_message(keypair: &mesh_crypto::Keypair, ttl: u8) -> Message {
        let mut msg = Message {
            header: Header {
                version: HEADER_VERSION,
                msg_type: MessageType::Text,
                ttl,
                timestamp_ms: 1000,
                sender_pubkey: keypair.public_key(),
                signature: Signature::zeroed(),
                recipient: None,
            },
            payload: b"hello".to_vec(),
        };
        msg.sign(keypair);
        msg
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let kp = mesh_crypto::Keypair::generate();
        let msg = build_message(&kp, 5);
        assert!(msg.verify());
    }

    #[test]
    fn tampered_ttl_fails_verification() {
        let kp = mesh_crypto::Keypair::generate();
        let mut msg = build_message(&kp, 5);
        msg.header.ttl = 4;
        assert!(!msg.verify());
    }

    #[test]
    fn forwarded_decrements_ttl() {
        let kp = mesh_crypto::Keypair::generate();
        let msg = build_message(&kp, 5);
        let fwd = msg.forwarded();
        assert_eq!(fwd.header.ttl, 4);
    }

    #[test]
    fn content_hash_ignores_signature_bytes() {
        let kp = mesh_crypto::Keypair::generate();
        let msg1 = build_message(&kp, 5);
        let mut msg2 = msg1.clone();
        msg2.header.signature = Signature([7u8; mesh_crypto::SIGNATURE_LEN]);
        assert_eq!(msg1.content_hash(), msg2.content_hash());
    }

    #[test]
    fn encode_decode_roundtrips() {
        let kp = mesh_crypto::Keypair::generate();
        let msg = build_message(&kp, 5);
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert!(decoded.verify());
        assert_eq!(decoded.content_hash(), msg.content_hash());
    }

    #[test]
    fn broadcast_set_matches_spec() {
        assert!(MessageType::PeerDiscovery.is_broadcast_type());
        assert!(MessageType::ControlPing.is_broadcast_type());
        assert!(!MessageType::Text.is_broadcast_type());
    }
}
