//! The Orchestrator (§4.5): owns identity and all subsystem state, wires
//! transports into the ingress/relay/DHT/gossip pipeline, and drives the
//! background timers (heartbeat, health, session presence, retry,
//! gossip rounds, escalation).
//!
//! Grounded in the teacher's `node::MeshNode` top-level wiring: one struct
//! holding every subsystem behind its own lock, background tasks spawned
//! off a `tokio::sync::watch` shutdown signal, and a `TransportCallbacks`
//! adapter bridging transport events back onto the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mesh_crypto::{ContentHash, Keypair};
use mesh_identity::NodeId;
use parking_lot::Mutex as SyncMutex;
use rand::RngCore;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::dht::lookup::{self, DhtQuerier, FindValueResult, LookupConfig};
use crate::dht::store::{self as dht_store, DhtValueStore, InMemoryValueStore, StoreOutcome, StoreTransport};
use crate::dht::KademliaTable;
use crate::error::{MeshError, MeshResult};
use crate::gossip::{GossipEngine, GossipTransport};
use crate::message::{Header, Message, MessageType, HEADER_VERSION};
use crate::persistence::{EternalLedgerAdapter, LedgerEntry, Priority, StoredMessageAdapter};
use crate::relay::forward::{select_broadcast, select_targeted};
use crate::relay::fragment::{fragment_bytes, fragment_size, Fragment};
use crate::relay::{ForwardSender, IngressOutcome, IngressPipeline, Reassembler, StoreAndForward};
use crate::routing::{Peer, RankedPeer, RoutingTable};
use crate::rpc::{
    FindNodeRequest, FindNodeResponse, FindValueRequest, FindValueResponse as WireFindValueResponse,
    GossipDigestPayload, GossipPushPayload, PingPayload, PongPayload, SessionPresencePayload, StoreAck,
    StoreRequest,
};
use crate::scheduler::EscalatingQueue;
use crate::stats::{NodeStats, NodeStatsSnapshot};
use crate::transport::{Transport, TransportCallbacks, TransportManager, TransportTag};

/// Default hop budget for an application-originated message (§6).
const DEFAULT_MESSAGE_TTL: u8 = 16;
/// RPC and liveness-challenge messages are direct, single-hop exchanges.
const RPC_TTL: u8 = 1;
/// How often the egress queue is drained once escalation has promoted it;
/// kept well below `escalation_check_interval` so ordinary forwarding
/// isn't held hostage to the aging cadence.
const EGRESS_DRAIN_INTERVAL: Duration = Duration::from_millis(100);
/// Approximate per-fragment header+signature overhead subtracted from the
/// transport MTU before computing a fragment's payload budget.
const FRAGMENT_OVERHEAD: usize = 256;

fn now_ms(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Delivered to the application for any message classified as local and
/// not claimed by a subsystem (Text/Voice/File*/PeerDiscovery/...).
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_local_message(&self, message: Message, from_peer: NodeId);
}

/// Fired when this node's session loses a presence conflict (§4.5 single
/// session enforcement, P10) and is about to shut down.
pub trait SessionInvalidatedCallback: Send + Sync {
    fn on_session_invalidated(&self);
}

#[derive(Clone, Copy)]
struct SessionState {
    session_id: [u8; 16],
    timestamp_ms: u64,
}

/// Bridges transport-level events back onto the node without the
/// transport needing an `Arc<Node>` cycle.
struct NodeCallbacks(Weak<Node>);

#[async_trait]
impl TransportCallbacks for NodeCallbacks {
    async fn on_message(&self, peer_id: NodeId, bytes: Vec<u8>) {
        if let Some(node) = self.0.upgrade() {
            node.handle_inbound(peer_id, bytes).await;
        }
    }

    async fn on_peer_connected(&self, peer_id: NodeId, tag: TransportTag) {
        if let Some(node) = self.0.upgrade() {
            node.peer_tags.lock().insert(peer_id, tag);
            node.bootstrap_peer(peer_id).await;
            debug!(peer = %peer_id, "transport link up");
        }
    }

    async fn on_peer_disconnected(&self, peer_id: NodeId) {
        if let Some(node) = self.0.upgrade() {
            node.routing.lock().remove_peer(&peer_id);
            node.dht.lock().remove(&peer_id);
            node.peer_tags.lock().remove(&peer_id);
            debug!(peer = %peer_id, "transport link down");
        }
    }
}

pub struct Node {
    local_id: NodeId,
    keypair: Keypair,
    cfg: MeshConfig,

    routing: SyncMutex<RoutingTable>,
    dht: SyncMutex<KademliaTable>,
    dht_values: InMemoryValueStore,
    ingress: SyncMutex<IngressPipeline>,
    reassembler: SyncMutex<Reassembler>,
    gossip: AsyncMutex<GossipEngine>,
    egress_queue: SyncMutex<EscalatingQueue>,
    stats: NodeStats,

    transports: Arc<TransportManager>,
    stored_adapter: Arc<dyn StoredMessageAdapter>,
    ledger_adapter: Arc<dyn EternalLedgerAdapter>,

    pending: SyncMutex<HashMap<Uuid, oneshot::Sender<Vec<u8>>>>,
    session: SyncMutex<SessionState>,
    peer_tags: SyncMutex<HashMap<NodeId, TransportTag>>,
    peer_offline_strikes: SyncMutex<HashMap<NodeId, u32>>,
    listeners: SyncMutex<Vec<Arc<dyn MessageListener>>>,
    session_callback: SyncMutex<Option<Arc<dyn SessionInvalidatedCallback>>>,

    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    pub fn new(
        keypair: Keypair,
        cfg: MeshConfig,
        transports: Vec<Arc<dyn Transport>>,
        stored_adapter: Arc<dyn StoredMessageAdapter>,
        ledger_adapter: Arc<dyn EternalLedgerAdapter>,
    ) -> Arc<Self> {
        let local_id = NodeId::from_public_key(&keypair.public_key());
        let mut manager = TransportManager::new();
        for t in transports {
            manager.register(t);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut session_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut session_id);
        let now = SystemTime::now();

        Arc::new(Self {
            routing: SyncMutex::new(RoutingTable::new(local_id, &cfg)),
            dht: SyncMutex::new(KademliaTable::new(local_id, cfg.k_bucket_size)),
            dht_values: InMemoryValueStore::new(cfg.max_stored_messages),
            ingress: SyncMutex::new(IngressPipeline::new(&cfg)),
            reassembler: SyncMutex::new(Reassembler::new(cfg.reassembly_cap_bytes, cfg.reassembly_ttl)),
            gossip: AsyncMutex::new(GossipEngine::new(&cfg)),
            egress_queue: SyncMutex::new(EscalatingQueue::new(cfg.escalation_threshold)),
            stats: NodeStats::new(),
            transports: Arc::new(manager),
            stored_adapter,
            ledger_adapter,
            pending: SyncMutex::new(HashMap::new()),
            session: SyncMutex::new(SessionState {
                session_id,
                timestamp_ms: now_ms(now),
            }),
            peer_tags: SyncMutex::new(HashMap::new()),
            peer_offline_strikes: SyncMutex::new(HashMap::new()),
            listeners: SyncMutex::new(Vec::new()),
            session_callback: SyncMutex::new(None),
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            local_id,
            keypair,
            cfg,
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn register_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn register_session_invalidated_callback(&self, cb: Arc<dyn SessionInvalidatedCallback>) {
        *self.session_callback.lock() = Some(cb);
    }

    pub fn get_stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let callbacks: Arc<dyn TransportCallbacks> = Arc::new(NodeCallbacks(Arc::downgrade(self)));
        self.transports.start_all(callbacks).await?;

        self.spawn_loop(self.cfg.heartbeat_interval, |node| async move {
            node.heartbeat_tick().await;
        });
        self.spawn_loop(self.cfg.health_check_interval, |node| async move {
            node.health_tick().await;
        });
        self.spawn_loop(self.cfg.session_presence_interval, |node| async move {
            node.session_presence_tick().await;
        });
        self.spawn_loop(self.cfg.retry_interval, |node| async move {
            node.retry_tick().await;
        });
        self.spawn_loop(self.cfg.gossip_interval, |node| async move {
            node.gossip_round_tick().await;
        });
        self.spawn_loop(self.cfg.prune_interval, |node| async move {
            node.gossip_prune_tick().await;
        });
        self.spawn_loop(self.cfg.escalation_check_interval, |node| async move {
            node.escalate_tick().await;
        });
        self.spawn_loop(EGRESS_DRAIN_INTERVAL, |node| async move {
            node.drain_egress_once().await;
        });

        info!(local_id = %self.local_id, "node started");
        Ok(())
    }

    /// Cancels all timers, drains pending forwards best-effort, then
    /// closes transports (§5 Shutdown sequence).
    pub async fn stop(self: &Arc<Self>) -> MeshResult<()> {
        self.trigger_shutdown().await
    }

    /// Shared shutdown path for both the public `stop()` call and an
    /// internally-triggered shutdown (lost session presence conflict,
    /// P10). Idempotent; needs only `&self`.
    async fn trigger_shutdown(&self) -> MeshResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        self.drain_egress_once().await;
        self.transports.stop_all().await?;
        info!(local_id = %self.local_id, "node stopped");
        Ok(())
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, interval: Duration, mut tick: F)
    where
        F: FnMut(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let node = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { tick(node.clone()).await; }
                    _ = shutdown_rx.changed() => { break; }
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Signing / transmission helpers
    // -----------------------------------------------------------------

    fn build_message(&self, msg_type: MessageType, ttl: u8, recipient: Option<NodeId>, payload: Vec<u8>, now: SystemTime) -> Message {
        let mut message = Message {
            header: Header {
                version: HEADER_VERSION,
                msg_type,
                ttl,
                timestamp_ms: now_ms(now),
                sender_pubkey: self.keypair.public_key(),
                signature: mesh_crypto::Signature::zeroed(),
                recipient,
            },
            payload,
        };
        message.sign(&self.keypair);
        message
    }

    async fn transmit(&self, peer: NodeId, message: &Message) -> MeshResult<()> {
        let bytes = message.encode()?;
        self.transports.send(peer, bytes).await
    }

    /// Pushes a locally-originated message onto the starvation-preventing
    /// egress queue rather than sending it inline; the drain loop fans it
    /// out.
    fn enqueue_egress(&self, message: Message) {
        self.egress_queue.lock().push(message, None);
    }

    /// Pushes a message being forwarded on behalf of `from_peer`; the
    /// drain loop excludes that peer from the forwarding targets.
    fn enqueue_forward(&self, message: Message, from_peer: NodeId) {
        self.egress_queue.lock().push(message, Some(from_peer));
    }

    async fn drain_egress_once(&self) {
        loop {
            let popped = self.egress_queue.lock().pop();
            let Some((message, _class, from_peer)) = popped else { break };
            self.deliver_egress(message, from_peer).await;
        }
    }

    async fn escalate_tick(self: Arc<Self>) {
        self.egress_queue.lock().run_escalation(Instant::now());
    }

    /// Fans `message` out to its forwarding targets: every connected peer
    /// for a broadcast, the Smart Flood selection toward a known
    /// destination otherwise. Both branches exclude `self` and, when this
    /// message is being forwarded rather than locally originated, the peer
    /// it arrived from (§4.3 forwarding policy: `id ∉ {self, inbound
    /// peer}`). Individual send failures are counted but never abort the
    /// remaining sends.
    async fn deliver_egress(&self, message: Message, from_peer: Option<NodeId>) {
        let now = SystemTime::now();
        let targets: Vec<NodeId> = if message.header.msg_type.is_broadcast_type() || message.header.recipient.is_none() {
            let connected_except_sender: Vec<NodeId> = self
                .routing
                .lock()
                .connected_peers()
                .map(|p| p.id)
                .filter(|id| *id != self.local_id && Some(*id) != from_peer)
                .collect();
            select_broadcast(&connected_except_sender)
        } else {
            let dest = message.header.recipient.expect("checked above");
            let ranked: Vec<RankedPeer> = self
                .routing
                .lock()
                .get_ranked_peers_for_target(&dest, now)
                .into_iter()
                .filter(|r| r.id != self.local_id && Some(r.id) != from_peer)
                .collect();
            select_targeted(&ranked, self.cfg.flood_threshold)
        };

        for peer in targets {
            match self.transmit(peer, &message).await {
                Ok(()) => NodeStats::incr(&self.stats.messages_forwarded),
                Err(e) => warn!(peer = %peer, error = %e, "egress delivery failed"),
            }
        }
    }

    // -----------------------------------------------------------------
    // Public messaging API
    // -----------------------------------------------------------------

    /// Sends `content` to `dest`. If a route is known the message is
    /// flooded selectively toward it; otherwise it is persisted for
    /// store-and-forward retry. Never fails merely because no route
    /// exists yet (§7).
    pub async fn send_message(&self, dest: NodeId, content: Vec<u8>, msg_type: MessageType) -> MeshResult<()> {
        let now = SystemTime::now();
        let message = self.build_message(msg_type, DEFAULT_MESSAGE_TTL, Some(dest), content, now);
        self.routing.lock().mark_seen(message.content_hash(), now);

        let has_route = self.routing.lock().get_next_hop(&dest, now).is_some();
        if has_route {
            self.enqueue_egress(message);
        } else {
            let saf = StoreAndForward::new(self.stored_adapter.as_ref(), &self.cfg);
            saf.store(message, dest, Priority::Normal, now).await?;
        }
        NodeStats::incr(&self.stats.messages_sent);
        Ok(())
    }

    /// Broadcasts `content` to the whole mesh: flooded immediately and
    /// also registered with the gossip engine for epidemic re-dissemination.
    pub async fn broadcast(&self, content: Vec<u8>, msg_type: MessageType) -> MeshResult<()> {
        let now = SystemTime::now();
        let message = self.build_message(msg_type, DEFAULT_MESSAGE_TTL, None, content, now);
        self.routing.lock().mark_seen(message.content_hash(), now);
        self.gossip.lock().await.record_message(message.clone(), now);
        self.enqueue_egress(message);
        NodeStats::incr(&self.stats.messages_sent);
        Ok(())
    }

    /// Splits `content` into fragments sized for `mtu` and queues each as
    /// its own `FileChunk` message; the receiving side's `Reassembler`
    /// reconstitutes them (§4.3 Fragmentation).
    pub async fn send_fragmented(&self, dest: NodeId, content: Vec<u8>, mtu: usize) -> MeshResult<()> {
        let now = SystemTime::now();
        let message_id = Uuid::new_v4();
        let size = fragment_size(mtu, FRAGMENT_OVERHEAD, self.cfg.min_fragment, self.cfg.max_fragment);
        for fragment in fragment_bytes(message_id, &content, size, now_ms(now)) {
            let payload = bincode::serialize(&fragment).map_err(|e| MeshError::DecodeFailed(e.to_string()))?;
            let message = self.build_message(MessageType::FileChunk, DEFAULT_MESSAGE_TTL, Some(dest), payload, now);
            self.routing.lock().mark_seen(message.content_hash(), now);
            self.enqueue_egress(message);
        }
        NodeStats::incr(&self.stats.messages_sent);
        Ok(())
    }

    pub async fn connect_to_peer(&self, id: NodeId, hint: Option<String>) -> MeshResult<()> {
        self.transports.connect(id, hint).await
    }

    pub async fn disconnect_from_peer(&self, id: NodeId) -> MeshResult<()> {
        let result = self.transports.disconnect(id).await;
        self.routing.lock().remove_peer(&id);
        self.dht.lock().remove(&id);
        self.peer_offline_strikes.lock().remove(&id);
        result
    }

    // -----------------------------------------------------------------
    // DHT public API
    // -----------------------------------------------------------------

    fn lookup_cfg(&self) -> LookupConfig {
        LookupConfig {
            alpha: self.cfg.alpha,
            k: self.cfg.k_bucket_size,
            query_timeout: self.cfg.dht_query_timeout,
            max_rounds: self.cfg.dht_max_rounds,
        }
    }

    fn dht_seed(&self, target: &NodeId) -> Vec<NodeId> {
        self.dht.lock().find_closest(target, self.cfg.k_bucket_size)
    }

    pub async fn dht_find_node(&self, target: NodeId) -> Vec<NodeId> {
        let seed = self.dht_seed(&target);
        NodeStats::incr(&self.stats.dht_lookups);
        lookup::find_node(self, self.local_id, target, seed, &self.lookup_cfg()).await
    }

    pub async fn dht_find_value(&self, key: ContentHash) -> FindValueResult {
        if let Some(value) = self.dht_values.get(&key) {
            return FindValueResult::Value(value);
        }
        let key_as_node = NodeId::from_bytes(key.0);
        let seed = self.dht_seed(&key_as_node);
        NodeStats::incr(&self.stats.dht_lookups);
        lookup::find_value(self, self.local_id, key_as_node, key, seed, &self.lookup_cfg()).await
    }

    pub async fn dht_store(&self, key: ContentHash, value: Vec<u8>) -> StoreOutcome {
        let key_as_node = NodeId::from_bytes(key.0);
        let seed = self.dht_seed(&key_as_node);
        dht_store::store(
            self,
            self,
            &self.dht_values,
            self.local_id,
            key,
            key_as_node,
            value,
            seed,
            &self.lookup_cfg(),
            SystemTime::now(),
        )
        .await
    }

    // -----------------------------------------------------------------
    // RPC plumbing
    // -----------------------------------------------------------------

    async fn send_rpc(&self, peer: NodeId, msg_type: MessageType, payload: Vec<u8>, request_id: Uuid, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let message = self.build_message(msg_type, RPC_TTL, Some(peer), payload, SystemTime::now());
        if let Err(e) = self.transmit(peer, &message).await {
            self.pending.lock().remove(&request_id);
            return Err(anyhow::anyhow!(e));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(anyhow::anyhow!("rpc channel dropped")),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(anyhow::anyhow!("rpc timed out"))
            }
        }
    }

    fn resolve_pending(&self, request_id: Uuid, bytes: Vec<u8>) -> bool {
        if let Some(tx) = self.pending.lock().remove(&request_id) {
            let _ = tx.send(bytes);
            true
        } else {
            false
        }
    }

    /// Announces this identity to a peer the transport layer just linked
    /// up, using the ordinary ping RPC rather than a dedicated handshake
    /// type: the reply path already drives `register_peer_if_new` on both
    /// ends, and a dropped announcement just delays discovery rather than
    /// breaking it (the next heartbeat or inbound message registers the
    /// peer anyway).
    async fn bootstrap_peer(&self, peer_id: NodeId) {
        let now = SystemTime::now();
        let Ok(payload) = bincode::serialize(&PingPayload {
            request_id: Uuid::new_v4(),
            origin_timestamp_ms: now_ms(now),
        }) else {
            return;
        };
        let message = self.build_message(MessageType::ControlPing, RPC_TTL, Some(peer_id), payload, now);
        let _ = self.transmit(peer_id, &message).await;
    }

    /// One-shot unicast ping used for K-bucket liveness challenges;
    /// returns whether a matching pong arrived before `timeout`.
    async fn ping_peer(&self, peer: NodeId, timeout: Duration) -> bool {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let now = SystemTime::now();
        let payload = match bincode::serialize(&PingPayload {
            request_id,
            origin_timestamp_ms: now_ms(now),
        }) {
            Ok(p) => p,
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return false;
            }
        };
        let message = self.build_message(MessageType::ControlPing, RPC_TTL, Some(peer), payload, now);
        if self.transmit(peer, &message).await.is_err() {
            self.pending.lock().remove(&request_id);
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(_)))
    }

    // -----------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------

    /// Runs `bytes` through the ingress pipeline; returns whether the
    /// message was accepted (vs. dropped as duplicate/expired/unsigned/etc).
    async fn handle_inbound(&self, from_peer: NodeId, bytes: Vec<u8>) -> bool {
        let now = SystemTime::now();
        let monotonic = Instant::now();
        let outcome = {
            let mut routing = self.routing.lock();
            let mut pipeline = self.ingress.lock();
            pipeline.process(&mut routing, &bytes, from_peer, self.local_id, now, monotonic, &self.stats)
        };

        let accepted = match outcome {
            IngressOutcome::Dropped(reason) => {
                debug!(peer = %from_peer, ?reason, "message dropped at ingress");
                return false;
            }
            IngressOutcome::Accepted(a) => a,
        };

        self.register_peer_if_new(from_peer, &accepted.message, now).await;

        if let Some(forward) = accepted.forward {
            self.enqueue_forward(forward, accepted.from_peer);
        }

        if accepted.is_subsystem_rpc {
            self.dispatch_subsystem(accepted.message, from_peer, now).await;
        } else if accepted.is_for_self {
            self.dispatch_local(accepted.message, from_peer).await;
        }
        true
    }

    async fn register_peer_if_new(&self, from_peer: NodeId, message: &Message, now: SystemTime) {
        let is_new = {
            let mut routing = self.routing.lock();
            let is_new = routing.get_peer(&from_peer).is_none();
            if is_new {
                let tag = self.peer_tags.lock().get(&from_peer).copied().unwrap_or(TransportTag::Other);
                routing.add_peer(Peer::new(from_peer, message.header.sender_pubkey, tag, now));
            }
            is_new
        };
        if is_new {
            self.record_sighting(from_peer, None, now).await;
        }
        self.gossip.lock().await.record_peer_activity(from_peer, now);

        let ping_needed = self.dht.lock().on_contact(from_peer, now);
        if let Some(candidate) = ping_needed {
            let alive = self.ping_peer(candidate, self.cfg.dht_query_timeout).await;
            self.dht.lock().resolve_ping(from_peer, candidate, alive, now);
        }
    }

    async fn dispatch_local(&self, message: Message, from_peer: NodeId) {
        if message.header.msg_type == MessageType::FileChunk {
            let Ok(fragment) = bincode::deserialize::<Fragment>(&message.payload) else { return };
            let complete = self.reassembler.lock().accept(fragment, SystemTime::now());
            let Some(bytes) = complete else { return };
            let mut reassembled = message;
            reassembled.payload = bytes;
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener.on_local_message(reassembled.clone(), from_peer).await;
            }
            return;
        }

        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_local_message(message.clone(), from_peer).await;
        }
    }

    /// Peers this node has directly exchanged authenticated traffic with,
    /// for persisted bootstrap on restart (§6 Eternal Ledger).
    pub async fn known_contacts(&self) -> MeshResult<Vec<LedgerEntry>> {
        self.ledger_adapter.get_all().await
    }

    /// Eternal Ledger sighting hook (§6 persistence contract): records
    /// first/renewed contact with `node_id`, optionally attributed to the
    /// gateway peer that relayed the sighting. Contact/conversation UX is
    /// out of scope; this only persists the sighting.
    pub async fn record_sighting(&self, node_id: NodeId, gateway_id: Option<NodeId>, now: SystemTime) {
        let _ = self
            .ledger_adapter
            .save(
                node_id,
                LedgerEntry {
                    node_id,
                    gateway_id,
                    last_seen: now,
                    metadata: serde_json::Value::Null,
                },
            )
            .await;
    }

    async fn dispatch_subsystem(&self, message: Message, from_peer: NodeId, now: SystemTime) {
        match message.header.msg_type {
            MessageType::DhtFindNode => self.handle_find_node_request(&message, from_peer).await,
            MessageType::DhtFoundNodes => self.handle_find_node_response(&message),
            MessageType::DhtFindValue => self.handle_find_value_request(&message, from_peer).await,
            MessageType::DhtFoundValue => self.handle_find_value_response(&message),
            MessageType::DhtStore => self.handle_store_request(&message, from_peer).await,
            MessageType::ControlAck => self.handle_control_ack(&message),
            MessageType::ControlPing => self.handle_control_ping(&message, from_peer).await,
            MessageType::ControlPong => self.handle_control_pong(&message, from_peer, now),
            MessageType::SessionPresence => self.handle_session_presence(&message, now).await,
            MessageType::GossipDigest => self.handle_gossip_digest(&message, from_peer, now).await,
            MessageType::GossipPush => self.handle_gossip_push(&message, from_peer, now).await,
            _ => self.dispatch_local(message, from_peer).await,
        }
    }

    async fn handle_find_node_request(&self, message: &Message, from_peer: NodeId) {
        let Ok(req) = bincode::deserialize::<FindNodeRequest>(&message.payload) else { return };
        let contacts = self.dht.lock().find_closest(&req.target, self.cfg.k_bucket_size);
        let Ok(payload) = bincode::serialize(&FindNodeResponse {
            request_id: req.request_id,
            contacts,
        }) else {
            return;
        };
        let reply = self.build_message(MessageType::DhtFoundNodes, RPC_TTL, Some(from_peer), payload, SystemTime::now());
        let _ = self.transmit(from_peer, &reply).await;
    }

    fn handle_find_node_response(&self, message: &Message) {
        if let Ok(resp) = bincode::deserialize::<FindNodeResponse>(&message.payload) {
            self.resolve_pending(resp.request_id, message.payload.clone());
        }
    }

    async fn handle_find_value_request(&self, message: &Message, from_peer: NodeId) {
        let Ok(req) = bincode::deserialize::<FindValueRequest>(&message.payload) else { return };
        let response = match self.dht_values.get(&req.key) {
            Some(value) => WireFindValueResponse::Value {
                request_id: req.request_id,
                value,
            },
            None => {
                let key_as_node = NodeId::from_bytes(req.key.0);
                WireFindValueResponse::Contacts {
                    request_id: req.request_id,
                    contacts: self.dht.lock().find_closest(&key_as_node, self.cfg.k_bucket_size),
                }
            }
        };
        let Ok(payload) = bincode::serialize(&response) else { return };
        let reply = self.build_message(MessageType::DhtFoundValue, RPC_TTL, Some(from_peer), payload, SystemTime::now());
        let _ = self.transmit(from_peer, &reply).await;
    }

    fn handle_find_value_response(&self, message: &Message) {
        if let Ok(resp) = bincode::deserialize::<WireFindValueResponse>(&message.payload) {
            let request_id = match &resp {
                WireFindValueResponse::Value { request_id, .. } => *request_id,
                WireFindValueResponse::Contacts { request_id, .. } => *request_id,
            };
            self.resolve_pending(request_id, message.payload.clone());
        }
    }

    async fn handle_store_request(&self, message: &Message, from_peer: NodeId) {
        let Ok(req) = bincode::deserialize::<StoreRequest>(&message.payload) else { return };
        self.dht_values.put(req.key, req.value, SystemTime::now());
        let Ok(payload) = bincode::serialize(&StoreAck {
            request_id: req.request_id,
            ok: true,
        }) else {
            return;
        };
        let reply = self.build_message(MessageType::ControlAck, RPC_TTL, Some(from_peer), payload, SystemTime::now());
        let _ = self.transmit(from_peer, &reply).await;
    }

    fn handle_control_ack(&self, message: &Message) {
        if let Ok(ack) = bincode::deserialize::<StoreAck>(&message.payload) {
            self.resolve_pending(ack.request_id, message.payload.clone());
        }
    }

    async fn handle_control_ping(&self, message: &Message, from_peer: NodeId) {
        if let Some(target) = message.header.recipient {
            if target != self.local_id {
                return;
            }
        }
        let Ok(ping) = bincode::deserialize::<PingPayload>(&message.payload) else { return };
        let Ok(payload) = bincode::serialize(&PongPayload {
            request_id: ping.request_id,
            origin_timestamp_ms: ping.origin_timestamp_ms,
        }) else {
            return;
        };
        let reply = self.build_message(MessageType::ControlPong, RPC_TTL, Some(from_peer), payload, SystemTime::now());
        let _ = self.transmit(from_peer, &reply).await;
    }

    fn handle_control_pong(&self, message: &Message, from_peer: NodeId, now: SystemTime) {
        let Ok(pong) = bincode::deserialize::<PongPayload>(&message.payload) else { return };
        if self.resolve_pending(pong.request_id, message.payload.clone()) {
            return;
        }
        let rtt_ms = now_ms(now).saturating_sub(pong.origin_timestamp_ms).min(u32::MAX as u64) as u32;
        self.routing.lock().update_route_metrics(&from_peer, rtt_ms, true, None, now);
    }

    async fn handle_session_presence(&self, message: &Message, now: SystemTime) {
        let Ok(presence) = bincode::deserialize::<SessionPresencePayload>(&message.payload) else { return };
        if NodeId::from_public_key(&presence.identity) != self.local_id {
            return;
        }
        let ours = *self.session.lock();
        if presence.session_id == ours.session_id {
            return;
        }
        let theirs_wins = (presence.timestamp_ms, presence.session_id) > (ours.timestamp_ms, ours.session_id);
        if theirs_wins {
            warn!("session presence conflict lost; invalidating local session");
            if let Some(cb) = self.session_callback.lock().clone() {
                cb.on_session_invalidated();
            }
            let _ = self.trigger_shutdown().await;
        }
        let _ = now;
    }

    async fn handle_gossip_digest(&self, message: &Message, from_peer: NodeId, now: SystemTime) {
        let Ok(req) = bincode::deserialize::<GossipDigestPayload>(&message.payload) else { return };
        let surplus = self.gossip.lock().await.surplus(&req.digest, now);
        let Ok(payload) = bincode::serialize(&GossipPushPayload {
            request_id: Some(req.request_id),
            messages: surplus,
        }) else {
            return;
        };
        let reply = self.build_message(MessageType::GossipPush, RPC_TTL, Some(from_peer), payload, now);
        let _ = self.transmit(from_peer, &reply).await;
    }

    async fn handle_gossip_push(&self, message: &Message, from_peer: NodeId, now: SystemTime) {
        let Ok(push) = bincode::deserialize::<GossipPushPayload>(&message.payload) else { return };
        if let Some(request_id) = push.request_id {
            self.resolve_pending(request_id, message.payload.clone());
            return;
        }
        for pushed in push.messages {
            self.absorb_gossip_message(from_peer, pushed, now).await;
        }
    }

    /// Re-enters a gossip-delivered message through relay ingress before
    /// trusting it (dedup/TTL/signature invariants, §4.4), then records it
    /// in gossip state so it can be offered to other peers. Used for both
    /// unsolicited pushes and messages returned from a digest exchange.
    async fn absorb_gossip_message(&self, from_peer: NodeId, message: Message, now: SystemTime) {
        let Ok(bytes) = message.encode() else { return };
        if Box::pin(self.handle_inbound(from_peer, bytes)).await {
            self.gossip.lock().await.absorb(message, now);
        }
    }

    // -----------------------------------------------------------------
    // Background ticks
    // -----------------------------------------------------------------

    async fn heartbeat_tick(self: Arc<Self>) {
        let now = SystemTime::now();
        let Ok(payload) = bincode::serialize(&PingPayload {
            request_id: Uuid::new_v4(),
            origin_timestamp_ms: now_ms(now),
        }) else {
            return;
        };
        let message = self.build_message(MessageType::ControlPing, RPC_TTL, None, payload, now);
        self.enqueue_egress(message);
    }

    async fn health_tick(self: Arc<Self>) {
        let now = SystemTime::now();
        let ids: Vec<NodeId> = self.routing.lock().connected_peers().map(|p| p.id).collect();
        let mut to_disconnect = Vec::new();

        for id in ids {
            let elapsed = {
                let routing = self.routing.lock();
                routing.get_peer(&id).map(|p| now.duration_since(p.last_seen).unwrap_or_default())
            };
            let Some(elapsed) = elapsed else { continue };
            let mut strikes = self.peer_offline_strikes.lock();
            if elapsed > self.cfg.offline_threshold {
                let s = strikes.entry(id).or_insert(0);
                *s += 1;
                if *s >= self.cfg.offline_disconnect_strikes {
                    to_disconnect.push(id);
                }
            } else {
                strikes.remove(&id);
            }
        }

        for id in to_disconnect {
            warn!(peer = %id, "peer exceeded offline strike budget, disconnecting");
            let _ = self.disconnect_from_peer(id).await;
        }
    }

    async fn session_presence_tick(self: Arc<Self>) {
        let (session_id, timestamp_ms) = {
            let s = self.session.lock();
            (s.session_id, s.timestamp_ms)
        };
        let Ok(payload) = bincode::serialize(&SessionPresencePayload {
            session_id,
            timestamp_ms,
            identity: self.keypair.public_key(),
        }) else {
            return;
        };
        let message = self.build_message(MessageType::SessionPresence, RPC_TTL, None, payload, SystemTime::now());
        self.enqueue_egress(message);
    }

    async fn retry_tick(self: Arc<Self>) {
        let saf = StoreAndForward::new(self.stored_adapter.as_ref(), &self.cfg);
        let now = SystemTime::now();
        let mut routing = self.routing.lock();
        let report = match saf.run_retry_cycle(&mut routing, &*self, now).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "store-and-forward retry cycle failed");
                return;
            }
        };
        drop(routing);
        for (_, disposition) in report {
            use crate::relay::store_forward::RetryDisposition::*;
            match disposition {
                Delivered => NodeStats::incr(&self.stats.stored_messages_delivered),
                Expired => NodeStats::incr(&self.stats.stored_messages_expired),
                RetriesExhausted => NodeStats::incr(&self.stats.stored_messages_failed),
                StillPending => {}
            }
        }
    }

    async fn gossip_round_tick(self: Arc<Self>) {
        let now = SystemTime::now();
        let mut engine = self.gossip.lock().await;
        let report = engine.run_round(&*self, now).await;
        drop(engine);
        if report.mode.is_some() {
            NodeStats::incr(&self.stats.gossip_rounds);
        }
        for (peer, message) in report.pulled {
            self.absorb_gossip_message(peer, message, now).await;
        }
    }

    async fn gossip_prune_tick(self: Arc<Self>) {
        let now = SystemTime::now();
        self.gossip.lock().await.prune(now);
    }
}

// -----------------------------------------------------------------
// Trait adapters: `Node` speaks the collaborator traits each subsystem's
// standalone logic was built against, so that logic can run unmodified
// against the real transport.
// -----------------------------------------------------------------

#[async_trait]
impl DhtQuerier for Node {
    async fn find_node(&self, peer: NodeId, target: NodeId) -> anyhow::Result<Vec<NodeId>> {
        let request_id = Uuid::new_v4();
        let payload = bincode::serialize(&FindNodeRequest { request_id, target })?;
        let bytes = self.send_rpc(peer, MessageType::DhtFindNode, payload, request_id, self.cfg.dht_query_timeout).await?;
        let resp: FindNodeResponse = bincode::deserialize(&bytes)?;
        Ok(resp.contacts)
    }

    async fn find_value(&self, peer: NodeId, key: ContentHash) -> anyhow::Result<FindValueResult> {
        let request_id = Uuid::new_v4();
        let payload = bincode::serialize(&FindValueRequest { request_id, key })?;
        let bytes = self.send_rpc(peer, MessageType::DhtFindValue, payload, request_id, self.cfg.dht_query_timeout).await?;
        let resp: WireFindValueResponse = bincode::deserialize(&bytes)?;
        Ok(match resp {
            WireFindValueResponse::Value { value, .. } => FindValueResult::Value(value),
            WireFindValueResponse::Contacts { contacts, .. } => FindValueResult::Contacts(contacts),
        })
    }

    async fn on_query_failed(&self, peer: NodeId) {
        let now = SystemTime::now();
        self.routing.lock().update_route_metrics(&peer, 0, false, None, now);
    }
}

#[async_trait]
impl StoreTransport for Node {
    async fn store(&self, peer: NodeId, key: ContentHash, value: Vec<u8>) -> anyhow::Result<()> {
        let request_id = Uuid::new_v4();
        let payload = bincode::serialize(&StoreRequest { request_id, key, value })?;
        let bytes = self.send_rpc(peer, MessageType::DhtStore, payload, request_id, self.cfg.dht_query_timeout).await?;
        let ack: StoreAck = bincode::deserialize(&bytes)?;
        if ack.ok {
            Ok(())
        } else {
            Err(anyhow::anyhow!("store rejected by {peer}"))
        }
    }
}

#[async_trait]
impl GossipTransport for Node {
    async fn push_messages(&self, peer: NodeId, messages: Vec<Message>) {
        let Ok(payload) = bincode::serialize(&GossipPushPayload {
            request_id: None,
            messages,
        }) else {
            return;
        };
        let message = self.build_message(MessageType::GossipPush, RPC_TTL, Some(peer), payload, SystemTime::now());
        let _ = self.transmit(peer, &message).await;
    }

    async fn exchange_digest(&self, peer: NodeId, digest: Vec<ContentHash>) -> Vec<Message> {
        let request_id = Uuid::new_v4();
        let Ok(payload) = bincode::serialize(&GossipDigestPayload { request_id, digest }) else {
            return Vec::new();
        };
        match self.send_rpc(peer, MessageType::GossipDigest, payload, request_id, self.cfg.dht_query_timeout).await {
            Ok(bytes) => bincode::deserialize::<GossipPushPayload>(&bytes).map(|p| p.messages).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ForwardSender for Node {
    async fn attempt_delivery(&self, peer: NodeId, message: &Message) -> bool {
        self.transmit(peer, message).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::{InMemoryLedger, InMemoryStoredMessages};

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        fn tag(&self) -> TransportTag {
            TransportTag::Local
        }
        async fn start(&self, _callbacks: Arc<dyn TransportCallbacks>) -> MeshResult<()> {
            Ok(())
        }
        async fn stop(&self) -> MeshResult<()> {
            Ok(())
        }
        async fn connect(&self, _peer_id: NodeId, _hint: Option<String>) -> MeshResult<()> {
            Ok(())
        }
        async fn disconnect(&self, _peer_id: NodeId) -> MeshResult<()> {
            Ok(())
        }
        async fn send(&self, _peer_id: NodeId, _bytes: Vec<u8>) -> MeshResult<()> {
            Err(MeshError::PeerNotFound(NodeId::from_bytes([0; 32])))
        }
    }

    fn make_node() -> Arc<Node> {
        let keypair = Keypair::generate();
        Node::new(
            keypair,
            MeshConfig::default(),
            vec![Arc::new(NoopTransport)],
            Arc::new(InMemoryStoredMessages::default()),
            Arc::new(InMemoryLedger::default()),
        )
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_falls_back_to_store_and_forward() {
        let node = make_node();
        let dest = NodeId::from_bytes([9; 32]);
        node.send_message(dest, b"hi".to_vec(), MessageType::Text).await.unwrap();
        assert_eq!(node.stats.messages_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn broadcast_registers_with_gossip_engine() {
        let node = make_node();
        node.broadcast(b"hello mesh".to_vec(), MessageType::Text).await.unwrap();
        let engine = node.gossip.lock().await;
        assert_eq!(engine.digest_now(SystemTime::now()).len(), 1);
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent_and_clean() {
        let node = make_node();
        node.start().await.unwrap();
        node.start().await.unwrap();
        node.stop().await.unwrap();
        node.stop().await.unwrap();
    }

    struct RecordingSessionCallback(std::sync::atomic::AtomicBool);

    impl SessionInvalidatedCallback for RecordingSessionCallback {
        fn on_session_invalidated(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn losing_session_presence_conflict_invokes_callback_and_stops_the_node() {
        let node = make_node();
        let callback = Arc::new(RecordingSessionCallback(std::sync::atomic::AtomicBool::new(false)));
        node.register_session_invalidated_callback(callback.clone());
        node.start().await.unwrap();
        assert!(node.running.load(Ordering::SeqCst));

        let now = SystemTime::now();
        let ours = *node.session.lock();
        let payload = SessionPresencePayload {
            session_id: [9; 16],
            timestamp_ms: ours.timestamp_ms + 1,
            identity: node.keypair.public_key(),
        };
        let message = node.build_message(
            MessageType::SessionPresence,
            RPC_TTL,
            None,
            bincode::serialize(&payload).unwrap(),
            now,
        );

        node.handle_session_presence(&message, now).await;

        assert!(callback.0.load(Ordering::SeqCst));
        assert!(!node.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pulled_gossip_message_with_invalid_signature_is_not_absorbed() {
        let node = make_node();
        let kp = Keypair::generate();
        let mut message = Message {
            header: Header {
                version: HEADER_VERSION,
                msg_type: MessageType::Text,
                ttl: 5,
                timestamp_ms: 0,
                sender_pubkey: kp.public_key(),
                signature: mesh_crypto::Signature::zeroed(),
                recipient: None,
            },
            payload: b"legit".to_vec(),
        };
        message.sign(&kp);
        message.payload = b"tampered".to_vec();
        let hash = message.content_hash();

        let from_peer = NodeId::from_bytes([7; 32]);
        let now = SystemTime::now();
        node.absorb_gossip_message(from_peer, message, now).await;

        assert!(!node.gossip.lock().await.already_known(&hash));
        assert_eq!(node.stats.dropped_signature_invalid.load(Ordering::Relaxed), 1);
    }
}
