//! The Peer record (§3).

use mesh_crypto::PublicKey;
use mesh_identity::NodeId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::transport::TransportTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Connecting,
    Connected,
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerCapabilities {
    pub max_bandwidth_bps: u64,
    pub supported_transports: Vec<TransportTag>,
    pub protocol_version: u32,
    pub feature_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub public_key: PublicKey,
    pub transport_tag: TransportTag,
    pub first_connected_at: SystemTime,
    pub last_seen: SystemTime,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Connection quality in [0, 100].
    pub quality: u8,
    pub state: PeerState,
    pub capabilities: PeerCapabilities,
    pub reputation: u8,
    pub blacklisted_until: Option<SystemTime>,
    /// `None` means blacklisted forever, once `blacklisted_until_forever`
    /// is set; see `blacklist_forever`.
    pub blacklisted_forever: bool,
    pub successes: u64,
    pub failures: u64,
}

impl Peer {
    pub fn new(id: NodeId, public_key: PublicKey, transport_tag: TransportTag, now: SystemTime) -> Self {
        Self {
            id,
            public_key,
            transport_tag,
            first_connected_at: now,
            last_seen: now,
            bytes_sent: 0,
            bytes_received: 0,
            quality: 100,
            state: PeerState::Connecting,
            capabilities: PeerCapabilities::default(),
            reputation: 50,
            blacklisted_until: None,
            blacklisted_forever: false,
            successes: 0,
            failures: 0,
        }
    }

    pub fn is_blacklisted(&self, now: SystemTime) -> bool {
        if self.blacklisted_forever {
            return true;
        }
        matches!(self.blacklisted_until, Some(until) if until > now)
    }
}
