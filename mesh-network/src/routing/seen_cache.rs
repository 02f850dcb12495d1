//! Dedup cache: a bounded map from content hash to first-seen timestamp,
//! augmented by a small bloom filter for a sub-linear membership
//! pre-check, evicting by LRU plus age TTL (§3, §4.1, P7).

use lru::LruCache;
use mesh_crypto::ContentHash;
use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime};

/// A small fixed-size bloom filter used purely as a fast "definitely not
/// seen" pre-check before consulting the LRU map; false positives fall
/// through to the map, false negatives never occur.
struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    hashes: usize,
}

impl BloomFilter {
    fn new(capacity: usize, hashes: usize) -> Self {
        // ~10 bits per expected entry keeps false-positive rate low without
        // growing unboundedly with the cache cap.
        let num_bits = ((capacity.max(1) * 10) as u64).next_power_of_two();
        let words = (num_bits as usize / 64).max(1);
        Self {
            bits: vec![0u64; words],
            num_bits,
            hashes,
        }
    }

    fn positions(&self, hash: &ContentHash) -> Vec<u64> {
        let h1 = u64::from_be_bytes(hash.0[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(hash.0[8..16].try_into().unwrap());
        (0..self.hashes)
            .map(|i| (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits)
            .collect()
    }

    fn insert(&mut self, hash: &ContentHash) {
        for pos in self.positions(hash) {
            let word = (pos / 64) as usize;
            let bit = pos % 64;
            self.bits[word] |= 1 << bit;
        }
    }

    fn might_contain(&self, hash: &ContentHash) -> bool {
        self.positions(hash).into_iter().all(|pos| {
            let word = (pos / 64) as usize;
            let bit = pos % 64;
            self.bits[word] & (1 << bit) != 0
        })
    }

    fn clear(&mut self) {
        for w in self.bits.iter_mut() {
            *w = 0;
        }
    }
}

pub struct SeenCache {
    entries: LruCache<ContentHash, SystemTime>,
    bloom: BloomFilter,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            bloom: BloomFilter::new(capacity, 4),
            ttl,
        }
    }

    /// Has `hash` been marked seen, and not yet evicted by TTL? Expired
    /// entries are treated as unseen even if still physically present.
    pub fn has_seen(&mut self, hash: &ContentHash, now: SystemTime) -> bool {
        if !self.bloom.might_contain(hash) {
            return false;
        }
        match self.entries.get(hash) {
            Some(&first_seen) => now.duration_since(first_seen).unwrap_or_default() < self.ttl,
            None => false,
        }
    }

    /// Mark `hash` seen, evicting by LRU and age TTL to maintain the cap.
    pub fn mark_seen(&mut self, hash: ContentHash, now: SystemTime) {
        self.evict_expired(now);
        self.entries.put(hash, now);
        self.bloom.insert(&hash);
    }

    fn evict_expired(&mut self, now: SystemTime) {
        let expired: Vec<ContentHash> = self
            .entries
            .iter()
            .filter(|(_, &ts)| now.duration_since(ts).unwrap_or_default() >= self.ttl)
            .map(|(h, _)| *h)
            .collect();
        for h in expired {
            self.entries.pop(&h);
        }
        // Rebuilding the bloom filter on every expiry sweep would be
        // wasteful; it only ever produces false positives, which the LRU
        // lookup above resolves, so stale bits are harmless. Only clear it
        // outright if the cache emptied entirely.
        if self.entries.is_empty() {
            self.bloom.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ContentHash {
        ContentHash([byte; 32])
    }

    #[test]
    fn marks_and_detects_seen() {
        let mut cache = SeenCache::new(100, Duration::from_secs(60));
        let now = SystemTime::now();
        let h = hash(1);
        assert!(!cache.has_seen(&h, now));
        cache.mark_seen(h, now);
        assert!(cache.has_seen(&h, now));
    }

    #[test]
    fn expires_after_ttl() {
        let mut cache = SeenCache::new(100, Duration::from_millis(10));
        let now = SystemTime::now();
        let h = hash(2);
        cache.mark_seen(h, now);
        let later = now + Duration::from_millis(50);
        assert!(!cache.has_seen(&h, later));
    }

    #[test]
    fn respects_capacity_cap() {
        let mut cache = SeenCache::new(4, Duration::from_secs(600));
        let now = SystemTime::now();
        for i in 0..10u8 {
            cache.mark_seen(hash(i), now);
        }
        assert!(cache.len() <= 4);
    }
}
