pub mod kbucket;
pub mod lookup;
pub mod store;

use std::time::SystemTime;

use mesh_identity::{NodeId, NUM_BITS};

use kbucket::{Contact, ContactOutcome, KBucket};

pub use lookup::{DhtQuerier, FindValueResult, LookupConfig};
pub use store::{DhtValueStore, InMemoryValueStore, StoreOutcome, StoreTransport};

/// K-bucket overlay: `NUM_BITS` buckets (256 for 32-byte ids), one per
/// possible highest-set-bit position of the XOR distance to the local id.
pub struct KademliaTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
    k: usize,
}

impl KademliaTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            buckets: (0..NUM_BITS).map(|_| KBucket::new(k)).collect(),
            k,
        }
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        self.local_id.bucket_index(id)
    }

    /// Record contact with `id`. Returns `Some(peer_to_ping)` when the
    /// bucket is full and a liveness check is needed before `id` can be
    /// admitted; the caller must follow up with `resolve_ping`.
    pub fn on_contact(&mut self, id: NodeId, now: SystemTime) -> Option<NodeId> {
        let Some(idx) = self.bucket_index(&id) else { return None }; // self
        match self.buckets[idx].on_contact(id, now) {
            ContactOutcome::Accepted => None,
            ContactOutcome::PingOldest { candidate_to_ping, .. } => Some(candidate_to_ping),
        }
    }

    /// Resolve a pending ping: if the oldest contact is alive, the new
    /// contact is dropped; if it failed, the new contact replaces it.
    pub fn resolve_ping(&mut self, id: NodeId, oldest: NodeId, oldest_alive: bool, now: SystemTime) {
        let Some(idx) = self.bucket_index(&id) else { return };
        if oldest_alive {
            return;
        }
        self.buckets[idx].replace_oldest_with(oldest, Contact { id, last_seen: now });
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(idx) = self.bucket_index(id) {
            self.buckets[idx].remove(id);
        }
    }

    /// K closest contacts to `target`, searching the bucket covering
    /// `target`'s distance first, then expanding outward — O(log N) in
    /// the typical case since only a handful of buckets need scanning.
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<NodeId> {
        let mut result: Vec<NodeId> = Vec::with_capacity(k * 2);
        let home = self.bucket_index(target).unwrap_or(0);
        let mut offset: isize = 0;
        while result.len() < k && (offset as usize) <= NUM_BITS {
            let mut probed_any = false;
            for dir in [-1isize, 1isize] {
                if offset == 0 && dir == -1 {
                    continue;
                }
                let idx = home as isize + dir * offset;
                if idx < 0 || idx as usize >= NUM_BITS {
                    continue;
                }
                probed_any = true;
                result.extend(self.buckets[idx as usize].contacts().map(|c| c.id));
            }
            if offset == 0 {
                result.extend(self.buckets[home].contacts().map(|c| c.id));
            }
            offset += 1;
            if !probed_any && offset as usize > NUM_BITS {
                break;
            }
        }
        result.sort_by_key(|id| target.xor_distance(id));
        result.dedup();
        result.truncate(k);
        result
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    #[test]
    fn find_closest_returns_sorted_unique_contacts() {
        let mut table = KademliaTable::new(id(0), 20);
        let now = SystemTime::now();
        for i in 1..=10u8 {
            table.on_contact(id(i), now);
        }
        let closest = table.find_closest(&id(0), 5);
        assert_eq!(closest.len(), 5);
        let mut prev = None;
        for c in &closest {
            let d = id(0).xor_distance(c);
            if let Some(p) = prev {
                assert!(p <= d);
            }
            prev = Some(d);
        }
    }
}
