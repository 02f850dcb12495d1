//! STORE / replication (§4.3): locate the K closest nodes to a key via
//! FIND_NODE, replicate the value to each, and cache it locally at the
//! origin regardless of whether it lands in the local K closest set.

use async_trait::async_trait;
use mesh_crypto::ContentHash;
use mesh_identity::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

use super::lookup::{self, DhtQuerier, LookupConfig};

/// Sends a single STORE RPC to `peer`. Kept distinct from `DhtQuerier`
/// since a FIND_NODE lookup and a STORE replication fan-out are separate
/// RPC kinds over the same transport.
#[async_trait]
pub trait StoreTransport: Send + Sync {
    async fn store(&self, peer: NodeId, key: ContentHash, value: Vec<u8>) -> anyhow::Result<()>;
}

/// Local value storage with a hard capacity: entries beyond `max_entries`
/// evict the oldest (insertion order) rather than rejecting the new write,
/// so a node under quota pressure still tracks its most recent
/// responsibilities.
pub trait DhtValueStore: Send + Sync {
    fn put(&self, key: ContentHash, value: Vec<u8>, now: SystemTime);
    fn get(&self, key: &ContentHash) -> Option<Vec<u8>>;
    fn len(&self) -> usize;
}

pub struct InMemoryValueStore {
    max_entries: usize,
    entries: RwLock<HashMap<ContentHash, (Vec<u8>, SystemTime)>>,
    order: RwLock<Vec<ContentHash>>,
}

impl InMemoryValueStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }
}

impl DhtValueStore for InMemoryValueStore {
    fn put(&self, key: ContentHash, value: Vec<u8>, now: SystemTime) {
        let mut entries = self.entries.write();
        let mut order = self.order.write();
        if !entries.contains_key(&key) {
            order.push(key);
        }
        entries.insert(key, (value, now));
        while order.len() > self.max_entries {
            let evicted = order.remove(0);
            entries.remove(&evicted);
        }
    }

    fn get(&self, key: &ContentHash) -> Option<Vec<u8>> {
        self.entries.read().get(key).map(|(v, _)| v.clone())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Result of a STORE call: how many of the K closest nodes acknowledged
/// successfully, out of how many were attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub attempted: usize,
    pub succeeded: usize,
}

#[allow(clippy::too_many_arguments)]
pub async fn store(
    querier: &dyn DhtQuerier,
    store_transport: &dyn StoreTransport,
    local_store: &dyn DhtValueStore,
    local_id: NodeId,
    key: ContentHash,
    key_as_node: NodeId,
    value: Vec<u8>,
    seed: Vec<NodeId>,
    cfg: &LookupConfig,
    now: SystemTime,
) -> StoreOutcome {
    local_store.put(key, value.clone(), now);

    let targets = lookup::find_node(querier, local_id, key_as_node, seed, cfg).await;
    let attempted = targets.len();
    let mut succeeded = 0usize;
    for peer in targets {
        if peer == local_id {
            succeeded += 1;
            continue;
        }
        if store_transport.store(peer, key, value.clone()).await.is_ok() {
            succeeded += 1;
        }
    }
    StoreOutcome { attempted, succeeded }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_store_evicts_oldest_beyond_capacity() {
        let store = InMemoryValueStore::new(2);
        let now = SystemTime::now();
        store.put(ContentHash([1; 32]), b"a".to_vec(), now);
        store.put(ContentHash([2; 32]), b"b".to_vec(), now);
        store.put(ContentHash([3; 32]), b"c".to_vec(), now);
        assert_eq!(store.len(), 2);
        assert!(store.get(&ContentHash([1; 32])).is_none());
        assert!(store.get(&ContentHash([3; 32])).is_some());
    }

    #[test]
    fn value_store_roundtrips() {
        let store = InMemoryValueStore::new(10);
        let now = SystemTime::now();
        store.put(ContentHash([7; 32]), b"value".to_vec(), now);
        assert_eq!(store.get(&ContentHash([7; 32])), Some(b"value".to_vec()));
    }
}
