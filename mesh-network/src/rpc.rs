//! Wire payloads for the subsystem RPC message types (§6 "Payload
//! conventions"): DHT FIND_NODE/FIND_VALUE/STORE, control ping/pong RTT,
//! session presence, and gossip digest/push. Each request carries a
//! `request_id` so the orchestrator can correlate an asynchronous
//! response back to the in-flight caller.

use mesh_crypto::{ContentHash, PublicKey};
use mesh_identity::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub request_id: Uuid,
    pub target: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub request_id: Uuid,
    pub contacts: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub request_id: Uuid,
    pub key: ContentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FindValueResponse {
    Value { request_id: Uuid, value: Vec<u8> },
    Contacts { request_id: Uuid, contacts: Vec<NodeId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    pub request_id: Uuid,
    pub key: ContentHash,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreAck {
    pub request_id: Uuid,
    pub ok: bool,
}

/// Control ping/pong carry an origin timestamp so the requester can
/// derive RTT on receiving the matching pong (§4.5 Heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub request_id: Uuid,
    pub origin_timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub request_id: Uuid,
    pub origin_timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPresencePayload {
    pub session_id: [u8; 16],
    pub timestamp_ms: u64,
    pub identity: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDigestPayload {
    pub request_id: Uuid,
    pub digest: Vec<ContentHash>,
}

/// `request_id` is `Some` when this is the reply to a digest exchange
/// (carries the request's id for correlation), `None` for an unsolicited
/// push round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPushPayload {
    pub request_id: Option<Uuid>,
    pub messages: Vec<Message>,
}
