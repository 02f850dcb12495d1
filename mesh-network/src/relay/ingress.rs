//! The ten-step ingress pipeline (§4.3): decode, dedup, loop-detect,
//! mark-seen, TTL, flood-rate-limit, signature-verify, classify, and the
//! local-delivery/forwarding decision. Kept as synchronous decision logic
//! so it is fully unit-testable without a transport or a running node;
//! the caller performs the actual delivery/forward I/O based on the
//! returned `IngressOutcome`.

use std::time::{Instant, SystemTime};

use mesh_identity::NodeId;

use super::loop_cache::LoopCache;
use super::rate_limiter::FloodRateLimiter;
use crate::message::Message;
use crate::routing::table::RoutingTable;
use crate::stats::NodeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    DecodeFailed,
    Duplicate,
    Loop,
    Expired,
    RateLimited,
    SignatureInvalid,
}

#[derive(Debug, Clone)]
pub struct AcceptedMessage {
    pub message: Message,
    pub is_for_self: bool,
    pub is_broadcast: bool,
    pub is_subsystem_rpc: bool,
    /// `Some(forwarded)` when this message should continue propagating
    /// (TTL already decremented); `None` when forwarding stops here
    /// (unicast delivered, or TTL reached zero).
    pub forward: Option<Message>,
    /// Peer the message arrived from, so the forwarding stage can exclude
    /// it from the egress candidate set (§4.3 forwarding policy).
    pub from_peer: NodeId,
}

#[derive(Debug, Clone)]
pub enum IngressOutcome {
    Dropped(DropReason),
    Accepted(AcceptedMessage),
}

pub struct IngressPipeline {
    loop_cache: LoopCache,
    rate_limiter: FloodRateLimiter,
}

impl IngressPipeline {
    pub fn new(cfg: &crate::config::MeshConfig) -> Self {
        Self {
            loop_cache: LoopCache::new(cfg.max_loop_cache),
            rate_limiter: FloodRateLimiter::new(cfg.flood_rate_limit),
        }
    }

    pub fn process(
        &mut self,
        routing: &mut RoutingTable,
        bytes: &[u8],
        from_peer: NodeId,
        local_id: NodeId,
        now: SystemTime,
        monotonic_now: Instant,
        stats: &NodeStats,
    ) -> IngressOutcome {
        NodeStats::incr(&stats.messages_received);

        let message = match Message::decode(bytes) {
            Ok(m) => m,
            Err(_) => {
                NodeStats::incr(&stats.dropped_decode_failed);
                return IngressOutcome::Dropped(DropReason::DecodeFailed);
            }
        };

        let hash = message.content_hash();

        if routing.has_seen(&hash, now) {
            NodeStats::incr(&stats.dropped_duplicate);
            return IngressOutcome::Dropped(DropReason::Duplicate);
        }

        if self.loop_cache.check_and_record(hash, from_peer) {
            NodeStats::incr(&stats.dropped_loop);
            return IngressOutcome::Dropped(DropReason::Loop);
        }

        routing.mark_seen(hash, now);

        if message.header.ttl == 0 {
            NodeStats::incr(&stats.dropped_expired);
            return IngressOutcome::Dropped(DropReason::Expired);
        }

        if self.rate_limiter.record_and_check(from_peer, monotonic_now) {
            NodeStats::incr(&stats.dropped_rate_limited);
            return IngressOutcome::Dropped(DropReason::RateLimited);
        }

        let msg_type = message.header.msg_type;
        if !msg_type.is_control() && !message.verify() {
            NodeStats::incr(&stats.dropped_signature_invalid);
            routing.penalize_peer(&from_peer);
            return IngressOutcome::Dropped(DropReason::SignatureInvalid);
        }

        // A message with no single recipient floods to every connected peer
        // (see `Node::deliver_egress`'s identical condition) whether or not
        // its type is one of the protocol's own broadcast types — an
        // application broadcast (arbitrary `msg_type`, `recipient: None`)
        // needs the same local-delivery-plus-continue-flooding treatment.
        let is_broadcast = msg_type.is_broadcast_type() || message.header.recipient.is_none();
        let is_subsystem_rpc = msg_type.is_subsystem_rpc();
        let is_for_self =
            is_broadcast || is_subsystem_rpc || message.recipient() == Some(local_id);

        let forward = if is_for_self && !is_broadcast {
            None
        } else if message.header.ttl >= 1 {
            Some(message.forwarded())
        } else {
            None
        };

        IngressOutcome::Accepted(AcceptedMessage {
            message,
            is_for_self,
            is_broadcast,
            is_subsystem_rpc,
            forward,
            from_peer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::message::{Header, MessageType, HEADER_VERSION};
    use mesh_crypto::{Keypair, Signature};

    fn signed(kp: &Keypair, msg_type: MessageType, ttl: u8, recipient: Option<NodeId>) -> Message {
        let mut msg = Message {
            header: Header {
                version: HEADER_VERSION,
                msg_type,
                ttl,
                timestamp_ms: 0,
                sender_pubkey: kp.public_key(),
                signature: Signature::zeroed(),
                recipient,
            },
            payload: vec![],
        };
        msg.sign(kp);
        msg
    }

    fn fresh_pipeline_and_table() -> (IngressPipeline, RoutingTable) {
        let cfg = MeshConfig::default();
        (IngressPipeline::new(&cfg), RoutingTable::new(NodeId::from_bytes([0; 32]), &cfg))
    }

    #[test]
    fn duplicate_is_dropped_on_second_arrival() {
        let (mut pipeline, mut table) = fresh_pipeline_and_table();
        let kp = Keypair::generate();
        let msg = signed(&kp, MessageType::Text, 5, Some(NodeId::from_bytes([0; 32])));
        let bytes = msg.encode().unwrap();
        let now = SystemTime::now();
        let t0 = Instant::now();
        let local = NodeId::from_bytes([0; 32]);
        let p1 = NodeId::from_bytes([1; 32]);
        let p2 = NodeId::from_bytes([2; 32]);

        let first = pipeline.process(&mut table, &bytes, p1, local, now, t0, &NodeStats::new());
        assert!(matches!(first, IngressOutcome::Accepted(_)));

        let second = pipeline.process(&mut table, &bytes, p2, local, now, t0, &NodeStats::new());
        assert!(matches!(second, IngressOutcome::Dropped(DropReason::Duplicate)));
    }

    #[test]
    fn zero_ttl_is_dropped_as_expired() {
        let (mut pipeline, mut table) = fresh_pipeline_and_table();
        let kp = Keypair::generate();
        let msg = signed(&kp, MessageType::Text, 0, None);
        let bytes = msg.encode().unwrap();
        let outcome = pipeline.process(
            &mut table,
            &bytes,
            NodeId::from_bytes([1; 32]),
            NodeId::from_bytes([0; 32]),
            SystemTime::now(),
            Instant::now(),
            &NodeStats::new(),
        );
        assert!(matches!(outcome, IngressOutcome::Dropped(DropReason::Expired)));
    }

    #[test]
    fn tampered_signature_is_rejected_and_penalizes_reputation() {
        let (mut pipeline, mut table) = fresh_pipeline_and_table();
        let from_peer = NodeId::from_bytes([1; 32]);
        let peer_kp = Keypair::generate();
        table.add_peer(crate::routing::Peer::new(
            from_peer,
            peer_kp.public_key(),
            crate::transport::TransportTag::Local,
            SystemTime::now(),
        ));
        let before = table.get_peer(&from_peer).unwrap().reputation;

        let kp = Keypair::generate();
        let mut msg = signed(&kp, MessageType::Text, 5, None);
        msg.payload = b"tampered".to_vec();
        let bytes = msg.encode().unwrap();
        let outcome = pipeline.process(
            &mut table,
            &bytes,
            from_peer,
            NodeId::from_bytes([0; 32]),
            SystemTime::now(),
            Instant::now(),
            &NodeStats::new(),
        );
        assert!(matches!(outcome, IngressOutcome::Dropped(DropReason::SignatureInvalid)));
        assert!(table.get_peer(&from_peer).unwrap().reputation < before);
    }

    #[test]
    fn unicast_for_self_stops_forwarding() {
        let (mut pipeline, mut table) = fresh_pipeline_and_table();
        let local = NodeId::from_bytes([0; 32]);
        let kp = Keypair::generate();
        let msg = signed(&kp, MessageType::Text, 5, Some(local));
        let bytes = msg.encode().unwrap();
        let outcome = pipeline.process(
            &mut table,
            &bytes,
            NodeId::from_bytes([1; 32]),
            local,
            SystemTime::now(),
            Instant::now(),
            &NodeStats::new(),
        );
        match outcome {
            IngressOutcome::Accepted(accepted) => {
                assert!(accepted.is_for_self);
                assert!(accepted.forward.is_none());
            }
            IngressOutcome::Dropped(_) => panic!("expected acceptance"),
        }
    }

    #[test]
    fn broadcast_continues_forwarding_with_decremented_ttl() {
        let (mut pipeline, mut table) = fresh_pipeline_and_table();
        let local = NodeId::from_bytes([0; 32]);
        let kp = Keypair::generate();
        let msg = signed(&kp, MessageType::PeerDiscovery, 5, None);
        let bytes = msg.encode().unwrap();
        let outcome = pipeline.process(
            &mut table,
            &bytes,
            NodeId::from_bytes([1; 32]),
            local,
            SystemTime::now(),
            Instant::now(),
            &NodeStats::new(),
        );
        match outcome {
            IngressOutcome::Accepted(accepted) => {
                assert!(accepted.is_broadcast);
                let fwd = accepted.forward.expect("broadcast should keep forwarding");
                assert_eq!(fwd.header.ttl, 4);
            }
            IngressOutcome::Dropped(_) => panic!("expected acceptance"),
        }
    }
}
