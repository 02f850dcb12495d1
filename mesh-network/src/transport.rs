//! Transport contract (§6): the core consumes this trait, never a
//! concrete transport. Concrete transports (WebRTC/BLE/LAN) are out of
//! scope per spec.md's Non-goals; dispatch over the small closed set of
//! transport tags uses a plain enum, matching the teacher's convention of
//! tagged variants for small closed sets vs. trait objects for open-ended
//! collaborators (persistence).

use async_trait::async_trait;
use mesh_identity::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::MeshResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportTag {
    Webrtc,
    Bluetooth,
    Local,
    Other,
}

/// Callbacks a transport invokes on the core as connection and data events
/// occur. Implemented by the Transport Manager inside `Node`.
#[async_trait]
pub trait TransportCallbacks: Send + Sync {
    async fn on_message(&self, peer_id: NodeId, bytes: Vec<u8>);
    async fn on_peer_connected(&self, peer_id: NodeId, tag: TransportTag);
    async fn on_peer_disconnected(&self, peer_id: NodeId);
}

/// A point-to-point, bidirectional, best-effort, per-connection-ordered
/// byte channel. One Transport may serve many peers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn tag(&self) -> TransportTag;
    async fn start(&self, callbacks: std::sync::Arc<dyn TransportCallbacks>) -> MeshResult<()>;
    async fn stop(&self) -> MeshResult<()>;
    async fn connect(&self, peer_id: NodeId, hint: Option<String>) -> MeshResult<()>;
    async fn disconnect(&self, peer_id: NodeId) -> MeshResult<()>;
    async fn send(&self, peer_id: NodeId, bytes: Vec<u8>) -> MeshResult<()>;
}

/// Holds the set of registered transports and chooses one per send. Pure
/// routing over the small tag set: concrete transports aren't implemented
/// here (out of scope), only the manager that would dispatch to them.
pub struct TransportManager {
    transports: Vec<std::sync::Arc<dyn Transport>>,
    /// Which transport last succeeded in reaching a given peer, preferred
    /// for subsequent sends.
    preferred: parking_lot::RwLock<std::collections::HashMap<NodeId, TransportTag>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            preferred: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn register(&mut self, transport: std::sync::Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn note_success(&self, peer_id: NodeId, tag: TransportTag) {
        self.preferred.write().insert(peer_id, tag);
    }

    /// Attempt `connect` on every registered transport in order, returning
    /// the first success; a connected transport becomes preferred for
    /// subsequent sends.
    pub async fn connect(&self, peer_id: NodeId, hint: Option<String>) -> MeshResult<()> {
        let mut last_err = None;
        for transport in &self.transports {
            match transport.connect(peer_id, hint.clone()).await {
                Ok(()) => {
                    self.note_success(peer_id, transport.tag());
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(crate::error::MeshError::PeerNotFound(peer_id)))
    }

    /// Disconnect `peer_id` on every registered transport; best-effort,
    /// does not short-circuit on the first failure.
    pub async fn disconnect(&self, peer_id: NodeId) -> MeshResult<()> {
        let mut last_err = None;
        for transport in &self.transports {
            if let Err(e) = transport.disconnect(peer_id).await {
                last_err = Some(e);
            }
        }
        self.preferred.write().remove(&peer_id);
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start every registered transport with the same callback sink.
    pub async fn start_all(&self, callbacks: std::sync::Arc<dyn TransportCallbacks>) -> MeshResult<()> {
        for transport in &self.transports {
            transport.start(callbacks.clone()).await?;
        }
        Ok(())
    }

    /// Stop every registered transport; best-effort, does not short-circuit.
    pub async fn stop_all(&self) -> MeshResult<()> {
        let mut last_err = None;
        for transport in &self.transports {
            if let Err(e) = transport.stop().await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send to `peer_id`, preferring the last-successful transport for
    /// that peer, else the first registered transport.
    pub async fn send(&self, peer_id: NodeId, bytes: Vec<u8>) -> MeshResult<()> {
        let preferred_tag = self.preferred.read().get(&peer_id).copied();
        let ordered: Vec<_> = if let Some(tag) = preferred_tag {
            let mut first: Vec<_> = self.transports.iter().filter(|t| t.tag() == tag).collect();
            let mut rest: Vec<_> = self.transports.iter().filter(|t| t.tag() != tag).collect();
            first.append(&mut rest);
            first
        } else {
            self.transports.iter().collect()
        };

        let mut last_err = None;
        for transport in ordered {
            match transport.send(peer_id, bytes.clone()).await {
                Ok(()) => {
                    self.note_success(peer_id, transport.tag());
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(crate::error::MeshError::PeerNotFound(peer_id)))
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}
