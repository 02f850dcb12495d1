//! Smart Flood forwarding policy (§4.3 "Forwarding policy").

use mesh_identity::NodeId;

use crate::routing::table::RankedPeer;

/// `count = N` when `N <= flood_threshold`, else `max(flood_threshold,
/// ceil(0.1*N))` — the same constant doubles as both the flood-threshold
/// cutoff and the selection floor per spec.
pub fn smart_flood_count(candidate_count: usize, flood_threshold: usize) -> usize {
    if candidate_count <= flood_threshold {
        candidate_count
    } else {
        let tenth = (candidate_count as f64 * 0.1).ceil() as usize;
        flood_threshold.max(tenth)
    }
}

/// Selects forwarding targets when a recipient is known: ranks candidates
/// by target affinity and takes the computed ceiling.
pub fn select_targeted(ranked: &[RankedPeer], flood_threshold: usize) -> Vec<NodeId> {
    let count = smart_flood_count(ranked.len(), flood_threshold);
    ranked.iter().take(count).map(|r| r.id).collect()
}

/// Selects forwarding targets when no recipient is known: every connected
/// peer except the sender and self (caller has already excluded those).
pub fn select_broadcast(connected_except_sender: &[NodeId]) -> Vec<NodeId> {
    connected_except_sender.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_candidate_set_forwards_to_all() {
        assert_eq!(smart_flood_count(3, 5), 3);
        assert_eq!(smart_flood_count(5, 5), 5);
    }

    #[test]
    fn large_candidate_set_uses_ten_percent_floor_five() {
        assert_eq!(smart_flood_count(6, 5), 5);
        assert_eq!(smart_flood_count(100, 5), 10);
        assert_eq!(smart_flood_count(41, 5), 5);
    }

    #[test]
    fn select_targeted_takes_top_ranked() {
        let ranked: Vec<RankedPeer> = (0..20u8)
            .map(|i| RankedPeer {
                id: NodeId::from_bytes([i; 32]),
                score: 100.0 - i as f64,
            })
            .collect();
        let chosen = select_targeted(&ranked, 5);
        assert_eq!(chosen.len(), 5);
        assert_eq!(chosen[0], NodeId::from_bytes([0; 32]));
    }
}
