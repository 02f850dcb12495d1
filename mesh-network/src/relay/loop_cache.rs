//! Per-message upstream path tracking for loop detection (§4.3 step 3).

use mesh_crypto::ContentHash;
use mesh_identity::NodeId;
use std::collections::{HashMap, VecDeque};

pub struct LoopCache {
    paths: HashMap<ContentHash, Vec<NodeId>>,
    insertion_order: VecDeque<ContentHash>,
    cap: usize,
}

impl LoopCache {
    pub fn new(cap: usize) -> Self {
        Self {
            paths: HashMap::new(),
            insertion_order: VecDeque::new(),
            cap,
        }
    }

    /// Records `from_peer` on the upstream path for `hash`. Returns `true`
    /// if `from_peer` was already present (a loop), in which case the path
    /// is left untouched.
    pub fn check_and_record(&mut self, hash: ContentHash, from_peer: NodeId) -> bool {
        if !self.paths.contains_key(&hash) {
            self.insertion_order.push_back(hash);
            self.evict_if_over_cap();
        }
        let path = self.paths.entry(hash).or_default();
        if path.contains(&from_peer) {
            return true;
        }
        path.push(from_peer);
        false
    }

    fn evict_if_over_cap(&mut self) {
        if self.insertion_order.len() <= self.cap {
            return;
        }
        let to_evict = (self.cap / 10).max(1);
        for _ in 0..to_evict {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.paths.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> ContentHash {
        ContentHash([b; 32])
    }

    fn peer(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    #[test]
    fn repeated_upstream_peer_is_a_loop() {
        let mut cache = LoopCache::new(1000);
        assert!(!cache.check_and_record(hash(1), peer(1)));
        assert!(!cache.check_and_record(hash(1), peer(2)));
        assert!(cache.check_and_record(hash(1), peer(1)));
    }

    #[test]
    fn distinct_hashes_track_independent_paths() {
        let mut cache = LoopCache::new(1000);
        assert!(!cache.check_and_record(hash(1), peer(1)));
        assert!(!cache.check_and_record(hash(2), peer(1)));
    }

    #[test]
    fn over_cap_evicts_oldest_tenth() {
        let mut cache = LoopCache::new(10);
        for i in 0..10u8 {
            cache.check_and_record(hash(i), peer(0));
        }
        cache.check_and_record(hash(10), peer(0));
        assert!(cache.len() <= 10);
    }
}
