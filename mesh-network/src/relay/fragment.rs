//! Fragmentation and reassembly (§4.3 "Fragmentation").

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub type FragmentGroupId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub message_id: FragmentGroupId,
    pub index: u32,
    pub total: u32,
    pub bytes: Vec<u8>,
    pub timestamp_ms: u64,
}

/// `min(MAX_FRAGMENT, max(MIN_FRAGMENT, mtu - overhead))`.
pub fn fragment_size(mtu: usize, overhead: usize, min_fragment: usize, max_fragment: usize) -> usize {
    mtu.saturating_sub(overhead).clamp(min_fragment, max_fragment)
}

pub fn fragment_bytes(
    message_id: FragmentGroupId,
    payload: &[u8],
    size: usize,
    timestamp_ms: u64,
) -> Vec<Fragment> {
    if payload.is_empty() {
        return vec![Fragment {
            message_id,
            index: 0,
            total: 1,
            bytes: Vec::new(),
            timestamp_ms,
        }];
    }
    let total = payload.chunks(size).count() as u32;
    payload
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            message_id,
            index: i as u32,
            total,
            bytes: chunk.to_vec(),
            timestamp_ms,
        })
        .collect()
}

struct PartialMessage {
    total: u32,
    received: HashMap<u32, Vec<u8>>,
    started_at: SystemTime,
    size_bytes: usize,
}

/// Reassembles fragments arriving in any order, bounded by a total byte
/// cap across all in-progress messages and a per-message TTL. Overflow
/// evicts the oldest in-progress message entirely (§4.3).
pub struct Reassembler {
    in_progress: HashMap<FragmentGroupId, PartialMessage>,
    order: VecDeque<FragmentGroupId>,
    cap_bytes: usize,
    used_bytes: usize,
    ttl: Duration,
}

impl Reassembler {
    pub fn new(cap_bytes: usize, ttl: Duration) -> Self {
        Self {
            in_progress: HashMap::new(),
            order: VecDeque::new(),
            cap_bytes,
            used_bytes: 0,
            ttl,
        }
    }

    /// Accepts `fragment` arriving at `now`; returns the reassembled bytes
    /// once all `total` distinct indices have been received. Duplicate
    /// indices within a group are rejected (ignored).
    pub fn accept(&mut self, fragment: Fragment, now: SystemTime) -> Option<Vec<u8>> {
        self.evict_expired(now);

        let id = fragment.message_id;
        let frag_len = fragment.bytes.len();

        if !self.in_progress.contains_key(&id) {
            self.order.push_back(id);
            self.in_progress.insert(
                id,
                PartialMessage {
                    total: fragment.total,
                    received: HashMap::new(),
                    started_at: now,
                    size_bytes: 0,
                },
            );
        }
        let entry = self.in_progress.get_mut(&id)?;

        if entry.received.contains_key(&fragment.index) {
            return None;
        }
        entry.received.insert(fragment.index, fragment.bytes);
        entry.size_bytes += frag_len;
        self.used_bytes += frag_len;

        self.evict_while_over_cap();

        let entry = self.in_progress.get(&id)?;
        if entry.received.len() as u32 != entry.total {
            return None;
        }

        let entry = self.in_progress.remove(&id)?;
        self.order.retain(|gid| gid != &id);
        self.used_bytes -= entry.size_bytes;

        let mut out = Vec::with_capacity(entry.size_bytes);
        for i in 0..entry.total {
            out.extend_from_slice(entry.received.get(&i)?);
        }
        Some(out)
    }

    fn evict_expired(&mut self, now: SystemTime) {
        let expired: Vec<FragmentGroupId> = self
            .in_progress
            .iter()
            .filter(|(_, p)| now.duration_since(p.started_at).unwrap_or_default() > self.ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.remove(id);
        }
    }

    fn evict_while_over_cap(&mut self) {
        while self.used_bytes > self.cap_bytes {
            let Some(oldest) = self.order.front().copied() else { break };
            self.remove(oldest);
        }
    }

    fn remove(&mut self, id: FragmentGroupId) {
        if let Some(entry) = self.in_progress.remove(&id) {
            self.used_bytes -= entry.size_bytes;
        }
        self.order.retain(|gid| gid != &id);
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_then_reassemble_out_of_order_yields_original_bytes() {
        let payload = vec![7u8; 50_000];
        let id = Uuid::from_bytes([1; 16]);
        let fragments = fragment_bytes(id, &payload, 16 * 1024, 0);
        assert_eq!(fragments.len(), 4);

        let mut reassembler = Reassembler::new(100 * 1024 * 1024, Duration::from_secs(60));
        let now = SystemTime::now();
        let order = [2, 0, 3, 1];
        let mut result = None;
        for &i in &order {
            result = reassembler.accept(fragments[i].clone(), now);
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn duplicate_index_is_ignored() {
        let payload = vec![1u8; 2000];
        let id = Uuid::from_bytes([2; 16]);
        let fragments = fragment_bytes(id, &payload, 512, 0);
        let mut reassembler = Reassembler::new(1024 * 1024, Duration::from_secs(60));
        let now = SystemTime::now();
        assert!(reassembler.accept(fragments[0].clone(), now).is_none());
        assert!(reassembler.accept(fragments[0].clone(), now).is_none());
        assert_eq!(reassembler.in_progress_count(), 1);
    }

    #[test]
    fn expired_in_progress_message_is_evicted() {
        let payload = vec![1u8; 2000];
        let id = Uuid::from_bytes([3; 16]);
        let fragments = fragment_bytes(id, &payload, 512, 0);
        let mut reassembler = Reassembler::new(1024 * 1024, Duration::from_millis(10));
        let now = SystemTime::now();
        reassembler.accept(fragments[0].clone(), now);
        let later = now + Duration::from_millis(50);
        reassembler.accept(fragments[1].clone(), later);
        assert_eq!(reassembler.in_progress_count(), 1);
    }

    #[test]
    fn fragment_size_respects_bounds() {
        assert_eq!(fragment_size(2000, 100, 512, 16 * 1024), 1900);
        assert_eq!(fragment_size(400, 100, 512, 16 * 1024), 512);
        assert_eq!(fragment_size(100_000, 100, 512, 16 * 1024), 16 * 1024);
    }
}
