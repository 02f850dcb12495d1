//! Persistence contract (§6): a stored-message adapter for store-and-forward,
//! and an eternal-ledger adapter for survivable bootstrap. Both are
//! open-ended (any backing store), so dispatch is via trait object, unlike
//! the small closed transport-tag set.

use async_trait::async_trait;
use mesh_crypto::ContentHash;
use mesh_identity::NodeId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::error::MeshResult;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    pub destination: NodeId,
    pub attempts: u32,
    pub last_attempt: Option<SystemTime>,
    pub expires_at: SystemTime,
    pub priority: Priority,
    pub route_attempts: Vec<NodeId>,
}

/// `{save, get, remove, get_all, prune_expired(now), size}` per §6.
#[async_trait]
pub trait StoredMessageAdapter: Send + Sync {
    async fn save(&self, hash: ContentHash, msg: StoredMessage) -> MeshResult<()>;
    async fn get(&self, hash: &ContentHash) -> MeshResult<Option<StoredMessage>>;
    async fn remove(&self, hash: &ContentHash) -> MeshResult<()>;
    async fn get_all(&self) -> MeshResult<Vec<(ContentHash, StoredMessage)>>;
    async fn prune_expired(&self, now: SystemTime) -> MeshResult<usize>;
    async fn size(&self) -> MeshResult<usize>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub node_id: NodeId,
    pub gateway_id: Option<NodeId>,
    pub last_seen: SystemTime,
    pub metadata: serde_json::Value,
}

/// Same shape as the stored-message adapter plus a secondary gateway index,
/// for the Eternal Ledger (PotentialContact/MeshNeighbor/KnownNode).
#[async_trait]
pub trait EternalLedgerAdapter: Send + Sync {
    async fn save(&self, id: NodeId, entry: LedgerEntry) -> MeshResult<()>;
    async fn get(&self, id: &NodeId) -> MeshResult<Option<LedgerEntry>>;
    async fn remove(&self, id: &NodeId) -> MeshResult<()>;
    async fn get_all(&self) -> MeshResult<Vec<LedgerEntry>>;
    async fn prune_expired(&self, now: SystemTime, max_age: std::time::Duration) -> MeshResult<usize>;
    async fn size(&self) -> MeshResult<usize>;
    async fn index_by_gateway(&self, gateway: &NodeId) -> MeshResult<Vec<LedgerEntry>>;
}

/// In-memory adapter, useful as a default/test backend; production
/// deployments supply their own (sled, rocksdb, sqlite, ...) — selecting
/// one is out of scope for the core per spec.md.
pub mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryStoredMessages {
        inner: RwLock<HashMap<ContentHash, StoredMessage>>,
    }

    #[async_trait]
    impl StoredMessageAdapter for InMemoryStoredMessages {
        async fn save(&self, hash: ContentHash, msg: StoredMessage) -> MeshResult<()> {
            self.inner.write().insert(hash, msg);
            Ok(())
        }

        async fn get(&self, hash: &ContentHash) -> MeshResult<Option<StoredMessage>> {
            Ok(self.inner.read().get(hash).cloned())
        }

        async fn remove(&self, hash: &ContentHash) -> MeshResult<()> {
            self.inner.write().remove(hash);
            Ok(())
        }

        async fn get_all(&self) -> MeshResult<Vec<(ContentHash, StoredMessage)>> {
            Ok(self
                .inner
                .read()
                .iter()
                .map(|(h, m)| (*h, m.clone()))
                .collect())
        }

        async fn prune_expired(&self, now: SystemTime) -> MeshResult<usize> {
            let mut guard = self.inner.write();
            let before = guard.len();
            guard.retain(|_, m| m.expires_at > now);
            Ok(before - guard.len())
        }

        async fn size(&self) -> MeshResult<usize> {
            Ok(self.inner.read().len())
        }
    }

    #[derive(Default)]
    pub struct InMemoryLedger {
        inner: RwLock<HashMap<NodeId, LedgerEntry>>,
    }

    #[async_trait]
    impl EternalLedgerAdapter for InMemoryLedger {
        async fn save(&self, id: NodeId, entry: LedgerEntry) -> MeshResult<()> {
            self.inner.write().insert(id, entry);
            Ok(())
        }

        async fn get(&self, id: &NodeId) -> MeshResult<Option<LedgerEntry>> {
            Ok(self.inner.read().get(id).cloned())
        }

        async fn remove(&self, id: &NodeId) -> MeshResult<()> {
            self.inner.write().remove(id);
            Ok(())
        }

        async fn get_all(&self) -> MeshResult<Vec<LedgerEntry>> {
            Ok(self.inner.read().values().cloned().collect())
        }

        async fn prune_expired(
            &self,
            now: SystemTime,
            max_age: std::time::Duration,
        ) -> MeshResult<usize> {
            let mut guard = self.inner.write();
            let before = guard.len();
            guard.retain(|_, e| now.duration_since(e.last_seen).unwrap_or_default() < max_age);
            Ok(before - guard.len())
        }

        async fn size(&self) -> MeshResult<usize> {
            Ok(self.inner.read().len())
        }

        async fn index_by_gateway(&self, gateway: &NodeId) -> MeshResult<Vec<LedgerEntry>> {
            Ok(self
                .inner
                .read()
                .values()
                .filter(|e| e.gateway_id.as_ref() == Some(gateway))
                .cloned()
                .collect())
        }
    }
}
