//! The Routing Table (§4.1): peer registry, route table, dedup oracle,
//! reputation/blacklist enforcement, ranked peer selection.
//!
//! All mutation goes through `&mut self`; the owning `Node` serializes
//! access behind a single lock (§5 Shared-resource policy), matching the
//! teacher's `lib-storage::dht::peer_registry` convention of requiring
//! external synchronization rather than baking in interior mutability.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use mesh_crypto::ContentHash;
use mesh_identity::NodeId;

use super::peer::{Peer, PeerState};
use super::route::Route;
use super::seen_cache::SeenCache;
use crate::error::{MeshError, MeshResult};
use crate::transport::TransportTag;

const REPUTATION_SUCCESS_DELTA: i16 = 1;
const REPUTATION_FAILURE_DELTA: i16 = -2;
const REPUTATION_DEGRADE_THRESHOLD: u8 = 20;
const REPUTATION_RECOVER_THRESHOLD: u8 = 40;
const RELIABILITY_ALPHA: f64 = 0.3;

pub struct RoutingTable {
    local_id: NodeId,
    peers: HashMap<NodeId, Peer>,
    routes: HashMap<NodeId, Route>,
    seen: SeenCache,
    max_routes: usize,
    route_ttl: Duration,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, cfg: &crate::config::MeshConfig) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            routes: HashMap::new(),
            seen: SeenCache::new(cfg.max_seen_cache, cfg.seen_cache_ttl),
            max_routes: cfg.max_routes,
            route_ttl: cfg.route_ttl,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    // ---------------------------------------------------------------
    // Peer lifecycle
    // ---------------------------------------------------------------

    /// Idempotent: normalize id, write/update Peer, install a zero-hop
    /// direct Route (I1).
    pub fn add_peer(&mut self, mut peer: Peer) {
        let now = peer.last_seen;
        peer.state = PeerState::Connected;
        let id = peer.id;
        self.peers.insert(id, peer);
        let direct = Route::direct(id, now, self.route_ttl);
        self.routes.insert(id, direct);
    }

    pub fn remove_peer(&mut self, id: &NodeId) {
        self.peers.remove(id);
        self.routes.retain(|_, r| &r.next_hop != id);
    }

    pub fn get_peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.state == PeerState::Connected)
    }

    // ---------------------------------------------------------------
    // Routes
    // ---------------------------------------------------------------

    /// Insert `route` if no conflicting route exists for its destination,
    /// else replace iff the conflict policy deems it a winner (P5).
    /// Enforces `max_routes` by evicting expired routes first, then LRU by
    /// `metrics.last_used`.
    pub fn add_route(&mut self, route: Route, now: SystemTime) {
        let dest = route.destination;
        let accept = match self.routes.get(&dest) {
            None => true,
            Some(existing) => existing.loses_to(&route, now),
        };
        if !accept {
            return;
        }
        if self.routes.len() >= self.max_routes && !self.routes.contains_key(&dest) {
            self.evict_for_capacity(now);
        }
        self.routes.insert(dest, route);
    }

    fn evict_for_capacity(&mut self, now: SystemTime) {
        let expired: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(d, _)| *d)
            .collect();
        if !expired.is_empty() {
            for d in expired {
                self.routes.remove(&d);
            }
            return;
        }
        if let Some(oldest) = self
            .routes
            .iter()
            .min_by_key(|(_, r)| r.metrics.last_used)
            .map(|(d, _)| *d)
        {
            self.routes.remove(&oldest);
        }
    }

    /// Returns the next hop iff a non-expired route exists; expired routes
    /// are garbage-collected on read.
    pub fn get_next_hop(&mut self, dest: &NodeId, now: SystemTime) -> Option<NodeId> {
        let expired = matches!(self.routes.get(dest), Some(r) if r.is_expired(now));
        if expired {
            self.routes.remove(dest);
            return None;
        }
        self.routes.get(dest).map(|r| r.next_hop)
    }

    /// Update route metrics via EMA (α=0.3); side effect: peer reputation
    /// and state transitions (§4.1).
    pub fn update_route_metrics(
        &mut self,
        dest: &NodeId,
        latency_ms: u32,
        success: bool,
        bandwidth_bps: Option<u64>,
        now: SystemTime,
    ) {
        if let Some(route) = self.routes.get_mut(dest) {
            route.metrics.latency_ms = latency_ms;
            let sample = if success { 1.0 } else { 0.0 };
            route.metrics.reliability =
                RELIABILITY_ALPHA * sample + (1.0 - RELIABILITY_ALPHA) * route.metrics.reliability;
            if let Some(bw) = bandwidth_bps {
                route.metrics.bandwidth_bps = Some(bw);
            }
            route.metrics.last_used = now;
            let next_hop = route.next_hop;
            self.apply_reputation_delta(&next_hop, success);
        }
    }

    /// Apply a reputation penalty for misbehavior observed at ingress
    /// (e.g. a forged signature), independent of route-metric updates.
    pub fn penalize_peer(&mut self, peer_id: &NodeId) {
        self.apply_reputation_delta(peer_id, false);
    }

    fn apply_reputation_delta(&mut self, peer_id: &NodeId, success: bool) {
        let Some(peer) = self.peers.get_mut(peer_id) else { return };
        if success {
            peer.successes += 1;
            peer.reputation = (peer.reputation as i16 + REPUTATION_SUCCESS_DELTA).clamp(0, 100) as u8;
        } else {
            peer.failures += 1;
            peer.reputation = (peer.reputation as i16 + REPUTATION_FAILURE_DELTA).clamp(0, 100) as u8;
        }
        match peer.state {
            PeerState::Connected if peer.reputation < REPUTATION_DEGRADE_THRESHOLD => {
                peer.state = PeerState::Degraded;
            }
            PeerState::Degraded if peer.reputation > REPUTATION_RECOVER_THRESHOLD => {
                peer.state = PeerState::Connected;
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // Dedup cache
    // ---------------------------------------------------------------

    pub fn has_seen(&mut self, hash: &ContentHash, now: SystemTime) -> bool {
        self.seen.has_seen(hash, now)
    }

    pub fn mark_seen(&mut self, hash: ContentHash, now: SystemTime) {
        self.seen.mark_seen(hash, now);
    }

    // ---------------------------------------------------------------
    // Blacklist
    // ---------------------------------------------------------------

    pub fn blacklist_peer(&mut self, id: &NodeId, duration: Option<Duration>, now: SystemTime) {
        if let Some(peer) = self.peers.get_mut(id) {
            match duration {
                None => peer.blacklisted_forever = true,
                Some(d) => peer.blacklisted_until = Some(now + d),
            }
        }
    }

    pub fn unblacklist_peer(&mut self, id: &NodeId) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.blacklisted_forever = false;
            peer.blacklisted_until = None;
        }
    }

    /// Lazily unblocks expired entries on read.
    pub fn is_blacklisted(&mut self, id: &NodeId, now: SystemTime) -> bool {
        let Some(peer) = self.peers.get_mut(id) else { return false };
        if peer.blacklisted_forever {
            return true;
        }
        match peer.blacklisted_until {
            Some(until) if until > now => true,
            Some(_) => {
                peer.blacklisted_until = None;
                false
            }
            None => false,
        }
    }

    // ---------------------------------------------------------------
    // Peer selection
    // ---------------------------------------------------------------

    /// XOR-distance nearest peers to `target`, excluding blacklisted peers.
    /// A linear scan; the Kademlia K-bucket index (§4.2) is used instead
    /// when DHT mode is active and N is large.
    pub fn find_closest_peers(&mut self, target: &NodeId, k: usize, now: SystemTime) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        let mut candidates: Vec<NodeId> = ids
            .into_iter()
            .filter(|id| !self.is_blacklisted(id, now))
            .collect();
        candidates.sort_by_key(|id| target.xor_distance(id));
        candidates.truncate(k);
        candidates
    }

    /// Score-for-now ranking for adaptive forwarding (§4.1 Ranking policy).
    pub fn get_ranked_peers_for_target(&mut self, target: &NodeId, now: SystemTime) -> Vec<RankedPeer> {
        let dest_route = self.routes.get(target).cloned();
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        let blacklisted: std::collections::HashSet<NodeId> = ids
            .into_iter()
            .filter(|id| self.is_blacklisted(id, now))
            .collect();
        let mut ranked: Vec<RankedPeer> = self
            .peers
            .values()
            .filter(|p| !blacklisted.contains(&p.id))
            .map(|peer| {
                let score = Self::score_peer(peer, target, dest_route.as_ref());
                RankedPeer {
                    id: peer.id,
                    score,
                }
            })
            .collect();

        ranked.retain(|r| r.score >= 0.0);
        ranked.sort_by(|a, b| {
            if (a.score - b.score).abs() <= 10.0 {
                target.xor_distance(&a.id).cmp(&target.xor_distance(&b.id))
            } else {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            }
        });
        ranked
    }

    fn score_peer(peer: &Peer, target: &NodeId, dest_route: Option<&Route>) -> f64 {
        if peer.state == PeerState::Disconnected {
            return -1.0;
        }

        let mut score = peer.quality as f64;

        if peer.state == PeerState::Degraded {
            score -= 4.0 * (100.0 - peer.quality as f64);
        }

        if &peer.id == target {
            score += 2000.0;
        }

        if let Some(route) = dest_route {
            if route.next_hop == peer.id {
                score += 300.0 * (peer.quality as f64 / 100.0);
            }
        }

        let measured_bw = dest_route
            .filter(|r| r.next_hop == peer.id)
            .and_then(|r| r.metrics.bandwidth_bps)
            .unwrap_or(0) as f64;
        score += (measured_bw / 100_000.0).min(100.0);
        score += ((peer.capabilities.max_bandwidth_bps as f64) / 1_000_000.0).min(50.0);

        match peer.transport_tag {
            TransportTag::Local => score += 50.0,
            TransportTag::Bluetooth => score -= 50.0,
            _ => {}
        }

        score
    }

    // ---------------------------------------------------------------
    // Boundary validation
    // ---------------------------------------------------------------

    pub fn validate_hex_id(hex: &str) -> MeshResult<NodeId> {
        NodeId::from_hex(hex).map_err(MeshError::InvalidNodeId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedPeer {
    pub id: NodeId,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use mesh_crypto::Keypair;

    fn fresh_peer(id: NodeId, now: SystemTime) -> Peer {
        let kp = Keypair::generate();
        Peer::new(id, kp.public_key(), TransportTag::Local, now)
    }

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    #[test]
    fn add_peer_installs_direct_route() {
        let cfg = MeshConfig::default();
        let local = node_id(0);
        let mut table = RoutingTable::new(local, &cfg);
        let now = SystemTime::now();
        let peer_id = node_id(1);
        table.add_peer(fresh_peer(peer_id, now));
        assert_eq!(table.get_next_hop(&peer_id, now), Some(peer_id));
    }

    #[test]
    fn route_conflict_prefers_fewer_hops() {
        let cfg = MeshConfig::default();
        let mut table = RoutingTable::new(node_id(0), &cfg);
        let now = SystemTime::now();
        let dest = node_id(9);
        let via_x = Route {
            destination: dest,
            next_hop: node_id(1),
            created_at: now,
            metrics: crate::routing::RouteMetrics {
                hop_count: 3,
                latency_ms: 100,
                reliability: 0.9,
                bandwidth_bps: None,
                last_used: now,
            },
            expires_at: now + Duration::from_secs(60),
        };
        table.add_route(via_x, now);
        let via_y = Route {
            destination: dest,
            next_hop: node_id(2),
            created_at: now,
            metrics: crate::routing::RouteMetrics {
                hop_count: 2,
                latency_ms: 500,
                reliability: 0.5,
                bandwidth_bps: None,
                last_used: now,
            },
            expires_at: now + Duration::from_secs(60),
        };
        table.add_route(via_y, now);
        assert_eq!(table.get_next_hop(&dest, now), Some(node_id(2)));

        let via_z = Route {
            destination: dest,
            next_hop: node_id(3),
            created_at: now,
            metrics: crate::routing::RouteMetrics {
                hop_count: 2,
                latency_ms: 400,
                reliability: 0.9,
                bandwidth_bps: None,
                last_used: now,
            },
            expires_at: now + Duration::from_secs(60),
        };
        table.add_route(via_z, now);
        assert_eq!(table.get_next_hop(&dest, now), Some(node_id(3)));
    }

    #[test]
    fn blacklist_expires_after_duration() {
        let cfg = MeshConfig::default();
        let mut table = RoutingTable::new(node_id(0), &cfg);
        let now = SystemTime::now();
        let peer_id = node_id(1);
        table.add_peer(fresh_peer(peer_id, now));
        table.blacklist_peer(&peer_id, Some(Duration::from_secs(1)), now);
        assert!(table.is_blacklisted(&peer_id, now));
        let later = now + Duration::from_secs(2);
        assert!(!table.is_blacklisted(&peer_id, later));
    }

    #[test]
    fn blacklist_forever_never_expires() {
        let cfg = MeshConfig::default();
        let mut table = RoutingTable::new(node_id(0), &cfg);
        let now = SystemTime::now();
        let peer_id = node_id(1);
        table.add_peer(fresh_peer(peer_id, now));
        table.blacklist_peer(&peer_id, None, now);
        let much_later = now + Duration::from_secs(1_000_000);
        assert!(table.is_blacklisted(&peer_id, much_later));
    }

    #[test]
    fn find_closest_peers_sorted_by_xor_distance() {
        let cfg = MeshConfig::default();
        let mut table = RoutingTable::new(node_id(0), &cfg);
        let now = SystemTime::now();
        for i in 1..=5u8 {
            table.add_peer(fresh_peer(node_id(i), now));
        }
        let target = node_id(0);
        let closest = table.find_closest_peers(&target, 3, now);
        assert_eq!(closest.len(), 3);
        let mut prev = None;
        for id in &closest {
            let d = target.xor_distance(id);
            if let Some(p) = prev {
                assert!(p <= d);
            }
            prev = Some(d);
        }
    }

    #[test]
    fn reputation_transitions_state() {
        let cfg = MeshConfig::default();
        let mut table = RoutingTable::new(node_id(0), &cfg);
        let now = SystemTime::now();
        let peer_id = node_id(1);
        table.add_peer(fresh_peer(peer_id, now));
        for _ in 0..40 {
            table.update_route_metrics(&peer_id, 50, false, None, now);
        }
        assert_eq!(table.get_peer(&peer_id).unwrap().state, PeerState::Degraded);
    }
}
