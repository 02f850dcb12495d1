//! Iterative FIND_NODE / FIND_VALUE (§4.2).
//!
//! The querier is abstracted behind a trait so the lookup logic itself
//! (shortlist management, α-concurrency, termination) can be tested
//! without a real transport.

use async_trait::async_trait;
use mesh_crypto::ContentHash;
use mesh_identity::NodeId;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum FindValueResult {
    Value(Vec<u8>),
    Contacts(Vec<NodeId>),
}

/// Sends a single FIND_NODE/FIND_VALUE RPC to `peer` and awaits its reply.
/// A timeout or malformed reply should surface as `Err`, which the lookup
/// treats as no progress for that peer (§4.2 Failure semantics); the
/// querier is also the hook via which routing-table reliability feedback
/// happens on failure.
#[async_trait]
pub trait DhtQuerier: Send + Sync {
    async fn find_node(&self, peer: NodeId, target: NodeId) -> anyhow::Result<Vec<NodeId>>;
    async fn find_value(&self, peer: NodeId, key: ContentHash) -> anyhow::Result<FindValueResult>;
    /// Called by the lookup whenever a query to `peer` fails or times out,
    /// so the routing table's reliability/reputation feedback loop fires.
    async fn on_query_failed(&self, peer: NodeId);
}

struct Shortlist {
    target: NodeId,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeId>,
    entries: Vec<NodeId>,
}

impl Shortlist {
    fn new(target: NodeId, seed: Vec<NodeId>, local_id: NodeId) -> Self {
        let mut entries: Vec<NodeId> = seed.into_iter().filter(|id| *id != local_id).collect();
        entries.sort_by_key(|id| target.xor_distance(id));
        entries.dedup();
        let seen = entries.iter().copied().collect();
        Self {
            target,
            seen,
            queried: HashSet::new(),
            entries,
        }
    }

    fn unqueried(&self, alpha: usize) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|id| !self.queried.contains(id))
            .take(alpha)
            .copied()
            .collect()
    }

    fn closest_unqueried_distance(&self) -> Option<mesh_identity::XorDistance> {
        self.entries
            .iter()
            .find(|id| !self.queried.contains(id))
            .map(|id| self.target.xor_distance(id))
    }

    fn merge(&mut self, local_id: NodeId, contacts: Vec<NodeId>) -> bool {
        let before_closest = self.entries.first().map(|id| self.target.xor_distance(id));
        let mut improved = false;
        for id in contacts {
            if id == local_id || !self.seen.insert(id) {
                continue;
            }
            self.entries.push(id);
        }
        self.entries.sort_by_key(|id| self.target.xor_distance(id));
        if let Some(new_closest) = self.entries.first().map(|id| self.target.xor_distance(id)) {
            improved = before_closest.map(|b| new_closest < b).unwrap_or(true);
        }
        improved
    }

    fn k_closest(&self, k: usize) -> Vec<NodeId> {
        self.entries.iter().take(k).copied().collect()
    }
}

pub struct LookupConfig {
    pub alpha: usize,
    pub k: usize,
    pub query_timeout: Duration,
    pub max_rounds: usize,
}

/// FIND_NODE: returns the K closest contacts observed (§4.2).
pub async fn find_node(
    querier: &dyn DhtQuerier,
    local_id: NodeId,
    target: NodeId,
    seed: Vec<NodeId>,
    cfg: &LookupConfig,
) -> Vec<NodeId> {
    if seed.is_empty() {
        return Vec::new();
    }
    let mut shortlist = Shortlist::new(target, seed, local_id);

    for _round in 0..cfg.max_rounds {
        let batch = shortlist.unqueried(cfg.alpha);
        if batch.is_empty() {
            break;
        }
        for id in &batch {
            shortlist.queried.insert(*id);
        }

        let futures = batch.into_iter().map(|peer| async move {
            let result = tokio::time::timeout(cfg.query_timeout, querier.find_node(peer, target)).await;
            match result {
                Ok(Ok(contacts)) => Some(contacts),
                _ => {
                    querier.on_query_failed(peer).await;
                    None
                }
            }
        });
        let results: Vec<Option<Vec<NodeId>>> = futures::future::join_all(futures).await;

        let mut any_improvement = false;
        for contacts in results.into_iter().flatten() {
            if shortlist.merge(local_id, contacts) {
                any_improvement = true;
            }
        }

        if !any_improvement && shortlist.closest_unqueried_distance().is_none() {
            break;
        }
    }

    shortlist.k_closest(cfg.k)
}

/// FIND_VALUE: identical to FIND_NODE except the first responder with the
/// value short-circuits the lookup.
pub async fn find_value(
    querier: &dyn DhtQuerier,
    local_id: NodeId,
    key_as_node: NodeId,
    key: ContentHash,
    seed: Vec<NodeId>,
    cfg: &LookupConfig,
) -> FindValueResult {
    if seed.is_empty() {
        return FindValueResult::Contacts(Vec::new());
    }
    let mut shortlist = Shortlist::new(key_as_node, seed, local_id);

    for _round in 0..cfg.max_rounds {
        let batch = shortlist.unqueried(cfg.alpha);
        if batch.is_empty() {
            break;
        }
        for id in &batch {
            shortlist.queried.insert(*id);
        }

        let futures = batch.into_iter().map(|peer| async move {
            let result = tokio::time::timeout(cfg.query_timeout, querier.find_value(peer, key)).await;
            match result {
                Ok(Ok(r)) => Some(r),
                _ => {
                    querier.on_query_failed(peer).await;
                    None
                }
            }
        });
        let results: Vec<Option<FindValueResult>> = futures::future::join_all(futures).await;

        let mut any_improvement = false;
        for r in results.into_iter().flatten() {
            match r {
                FindValueResult::Value(v) => return FindValueResult::Value(v),
                FindValueResult::Contacts(contacts) => {
                    if shortlist.merge(local_id, contacts) {
                        any_improvement = true;
                    }
                }
            }
        }

        if !any_improvement && shortlist.closest_unqueried_distance().is_none() {
            break;
        }
    }

    FindValueResult::Contacts(shortlist.k_closest(cfg.k))
}
