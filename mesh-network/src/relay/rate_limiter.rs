//! Per-peer sliding 1s arrival window for flood rate limiting (§4.3 step 6).

use mesh_identity::NodeId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

pub struct FloodRateLimiter {
    arrivals: HashMap<NodeId, VecDeque<Instant>>,
    limit: usize,
}

impl FloodRateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            arrivals: HashMap::new(),
            limit,
        }
    }

    /// Records an arrival from `peer` at `now` and returns `true` if it
    /// should be dropped for exceeding the rate limit.
    pub fn record_and_check(&mut self, peer: NodeId, now: Instant) -> bool {
        let window = self.arrivals.entry(peer).or_default();
        while let Some(&front) = window.front() {
            if now.duration_since(front) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back(now);
        window.len() > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    #[test]
    fn under_limit_passes() {
        let mut limiter = FloodRateLimiter::new(5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(!limiter.record_and_check(peer(1), now));
        }
    }

    #[test]
    fn over_limit_within_window_is_dropped() {
        let mut limiter = FloodRateLimiter::new(3);
        let now = Instant::now();
        assert!(!limiter.record_and_check(peer(1), now));
        assert!(!limiter.record_and_check(peer(1), now));
        assert!(!limiter.record_and_check(peer(1), now));
        assert!(limiter.record_and_check(peer(1), now));
    }

    #[test]
    fn window_slides_after_one_second() {
        let mut limiter = FloodRateLimiter::new(1);
        let t0 = Instant::now();
        assert!(!limiter.record_and_check(peer(1), t0));
        let t1 = t0 + Duration::from_millis(1100);
        assert!(!limiter.record_and_check(peer(1), t1));
    }
}
