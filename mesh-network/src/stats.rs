//! Operational counters, grounded in the teacher's `dht/monitoring.rs` and
//! `mesh/statistics.rs`. spec.md's Non-goals exclude a UI to present these,
//! but the ambient counters themselves are kept regardless (SPEC_FULL.md
//! §12).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NodeStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub dropped_expired: AtomicU64,
    pub dropped_loop: AtomicU64,
    pub dropped_rate_limited: AtomicU64,
    pub dropped_signature_invalid: AtomicU64,
    pub dropped_decode_failed: AtomicU64,
    pub dht_lookups: AtomicU64,
    pub gossip_rounds: AtomicU64,
    pub stored_messages_delivered: AtomicU64,
    pub stored_messages_expired: AtomicU64,
    pub stored_messages_failed: AtomicU64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_expired: self.dropped_expired.load(Ordering::Relaxed),
            dropped_loop: self.dropped_loop.load(Ordering::Relaxed),
            dropped_rate_limited: self.dropped_rate_limited.load(Ordering::Relaxed),
            dropped_signature_invalid: self.dropped_signature_invalid.load(Ordering::Relaxed),
            dropped_decode_failed: self.dropped_decode_failed.load(Ordering::Relaxed),
            dht_lookups: self.dht_lookups.load(Ordering::Relaxed),
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
            stored_messages_delivered: self.stored_messages_delivered.load(Ordering::Relaxed),
            stored_messages_expired: self.stored_messages_expired.load(Ordering::Relaxed),
            stored_messages_failed: self.stored_messages_failed.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NodeStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub dropped_duplicate: u64,
    pub dropped_expired: u64,
    pub dropped_loop: u64,
    pub dropped_rate_limited: u64,
    pub dropped_signature_invalid: u64,
    pub dropped_decode_failed: u64,
    pub dht_lookups: u64,
    pub gossip_rounds: u64,
    pub stored_messages_delivered: u64,
    pub stored_messages_expired: u64,
    pub stored_messages_failed: u64,
}
