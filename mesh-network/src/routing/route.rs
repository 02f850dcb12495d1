//! The Route record and the conflict policy that decides whether a newly
//! learned route replaces the one currently on file for a destination.

use mesh_identity::NodeId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub hop_count: u8,
    pub latency_ms: u32,
    /// Reliability in [0, 1], updated via EMA (α = 0.3).
    pub reliability: f64,
    pub bandwidth_bps: Option<u64>,
    pub last_used: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub created_at: SystemTime,
    pub metrics: RouteMetrics,
    pub expires_at: SystemTime,
}

impl Route {
    pub fn direct(peer: NodeId, now: SystemTime, ttl: std::time::Duration) -> Self {
        Route {
            destination: peer,
            next_hop: peer,
            created_at: now,
            metrics: RouteMetrics {
                hop_count: 0,
                latency_ms: 0,
                reliability: 1.0,
                bandwidth_bps: None,
                last_used: now,
            },
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }

    /// True iff `candidate` should replace `self` as the route for a
    /// destination, per the conflict policy (§4.1):
    /// existing expired, OR strictly fewer hops, OR same hops and strictly
    /// lower latency, OR same hops+latency and strictly higher reliability,
    /// OR all tied and strictly higher bandwidth, OR all tied and newer
    /// timestamp.
    pub fn loses_to(&self, candidate: &Route, now: SystemTime) -> bool {
        if self.is_expired(now) {
            return true;
        }
        let (e, c) = (&self.metrics, &candidate.metrics);
        if c.hop_count != e.hop_count {
            return c.hop_count < e.hop_count;
        }
        if c.latency_ms != e.latency_ms {
            return c.latency_ms < e.latency_ms;
        }
        if c.reliability != e.reliability {
            return c.reliability > e.reliability;
        }
        let eb = e.bandwidth_bps.unwrap_or(0);
        let cb = c.bandwidth_bps.unwrap_or(0);
        if cb != eb {
            return cb > eb;
        }
        candidate.created_at > self.created_at
    }
}
