//! Error taxonomy for the mesh core (§7 of the design spec).
//!
//! Ingress/egress faults are recovered locally by the relay pipeline and
//! only surface as counters; these variants exist for the operations that
//! legitimately need to report failure to a caller (DHT lookups, explicit
//! peer connects, persistence/transport boundary failures).

use mesh_identity::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    // ---- InvalidInput ----
    #[error("malformed node id: {0}")]
    InvalidNodeId(#[from] mesh_identity::NodeIdError),
    #[error("unknown message type tag: {0}")]
    UnknownMessageType(u8),
    #[error("message exceeds maximum size: {actual} > {max}")]
    MessageTooLarge { actual: usize, max: usize },
    #[error("missing recipient for unicast message")]
    MissingRecipient,

    // ---- Integrity ----
    #[error("failed to decode message: {0}")]
    DecodeFailed(String),
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("fragment index {index} out of range for total {total}")]
    FragmentIndexOutOfRange { index: u32, total: u32 },

    // ---- Policy ----
    #[error("message ttl expired")]
    TtlExpired,
    #[error("duplicate message")]
    Duplicate,
    #[error("loop detected for message at peer {0}")]
    LoopDetected(NodeId),
    #[error("flood rate limit exceeded for peer {0}")]
    RateLimited(NodeId),
    #[error("peer {0} is blacklisted")]
    Blacklisted(NodeId),

    // ---- Transport ----
    #[error("transport send failed to {peer}: {reason}")]
    SendFailed { peer: NodeId, reason: String },
    #[error("peer not found: {0}")]
    PeerNotFound(NodeId),
    #[error("connection closed: {0}")]
    ConnectionClosed(NodeId),

    // ---- Resource ----
    #[error("{resource} at capacity ({cap})")]
    AtCapacity { resource: &'static str, cap: usize },
    #[error("no eligible peer to forward to")]
    NoEligiblePeer,

    // ---- Timeout ----
    #[error("dht query to {0} timed out")]
    DhtQueryTimeout(NodeId),
    #[error("fragment reassembly timed out for message {0}")]
    ReassemblyTimeout(String),
    #[error("blob request timed out")]
    BlobRequestTimeout,

    // ---- Fatal ----
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("transport manager crashed: {0}")]
    TransportManagerCrashed(String),
}

pub type MeshResult<T> = Result<T, MeshError>;
