//! Bandwidth scheduler contract and the starvation-preventing priority
//! queue (§6, §4.4 "Starvation prevention", §5 "Backpressure").

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mesh_identity::NodeId;

use crate::message::{Message, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl SchedulerPriority {
    fn bump(self) -> Self {
        match self {
            SchedulerPriority::Low => SchedulerPriority::Medium,
            SchedulerPriority::Medium => SchedulerPriority::High,
            SchedulerPriority::High => SchedulerPriority::Critical,
            SchedulerPriority::Critical => SchedulerPriority::Critical,
        }
    }
}

/// Highest-first priority classes for the gossip/relay egress escalation
/// policy (§4.4), distinct from the four-level `SchedulerPriority` used by
/// the bandwidth scheduler's admission contract (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscalationClass {
    ControlPing = 0,
    ControlPong = 1,
    ControlAck = 2,
    Voice = 3,
    Text = 4,
    FileChunk = 5,
    FileMetadata = 6,
}

impl EscalationClass {
    pub fn of(msg_type: MessageType) -> Self {
        match msg_type {
            MessageType::ControlPing => EscalationClass::ControlPing,
            MessageType::ControlPong => EscalationClass::ControlPong,
            MessageType::ControlAck => EscalationClass::ControlAck,
            MessageType::Voice => EscalationClass::Voice,
            MessageType::FileChunk => EscalationClass::FileChunk,
            MessageType::FileMetadata => EscalationClass::FileMetadata,
            _ => EscalationClass::Text,
        }
    }

    fn promote(self) -> Self {
        match self {
            EscalationClass::FileMetadata => EscalationClass::FileChunk,
            EscalationClass::FileChunk => EscalationClass::Text,
            EscalationClass::Text => EscalationClass::Voice,
            EscalationClass::Voice => EscalationClass::ControlAck,
            EscalationClass::ControlAck => EscalationClass::ControlPong,
            EscalationClass::ControlPong => EscalationClass::ControlPing,
            EscalationClass::ControlPing => EscalationClass::ControlPing,
        }
    }
}

struct QueuedMessage {
    message: Message,
    class: EscalationClass,
    enqueued_at: Instant,
    /// Peer the message was received from, if any, so forwarding can
    /// exclude it from the egress candidate set (§4.3 forwarding policy).
    from_peer: Option<NodeId>,
}

/// Priority queue with age-based promotion so a Low/FileMetadata-class
/// message never starves behind a constant stream of newer high-priority
/// arrivals (P9).
pub struct EscalatingQueue {
    lanes: std::collections::BTreeMap<EscalationClass, VecDeque<QueuedMessage>>,
    escalation_threshold: Duration,
}

impl EscalatingQueue {
    pub fn new(escalation_threshold: Duration) -> Self {
        Self {
            lanes: std::collections::BTreeMap::new(),
            escalation_threshold,
        }
    }

    pub fn push(&mut self, message: Message, from_peer: Option<NodeId>) {
        let class = EscalationClass::of(message.header.msg_type);
        self.lanes.entry(class).or_default().push_back(QueuedMessage {
            message,
            class,
            enqueued_at: Instant::now(),
            from_peer,
        });
    }

    /// Promote messages older than the escalation threshold to the next
    /// class up. Called periodically (default every 5s, §4.4).
    pub fn run_escalation(&mut self, now: Instant) {
        let classes: Vec<EscalationClass> = self.lanes.keys().copied().collect();
        for class in classes {
            let Some(queue) = self.lanes.get_mut(&class) else { continue };
            let mut stay = VecDeque::new();
            let mut promote = Vec::new();
            while let Some(item) = queue.pop_front() {
                if now.duration_since(item.enqueued_at) >= self.escalation_threshold
                    && item.class != item.class.promote()
                {
                    promote.push(item);
                } else {
                    stay.push_back(item);
                }
            }
            *self.lanes.get_mut(&class).unwrap() = stay;
            for mut item in promote {
                item.class = item.class.promote();
                self.lanes.entry(item.class).or_default().push_back(item);
            }
        }
    }

    /// Pop the highest-priority (lowest discriminant), oldest-first
    /// message, along with its current (possibly escalated) class and the
    /// peer it arrived from, if any.
    pub fn pop(&mut self) -> Option<(Message, EscalationClass, Option<NodeId>)> {
        for (class, queue) in self.lanes.iter_mut() {
            if let Some(item) = queue.pop_front() {
                return Some((item.message, *class, item.from_peer));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.lanes.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `schedule(msg) -> accepted`, `next() -> msg?`, `update_bandwidth(Bps)`,
/// `record_send(bytes)`, `metrics()` per §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerMetrics {
    pub available_bandwidth_bps: f64,
    pub utilization: f64,
    pub packet_loss: f64,
    pub bytes_sent: u64,
}

pub struct BandwidthScheduler {
    max_queue_size: usize,
    congestion_utilization: f64,
    congestion_packet_loss: f64,
    congestion_queue_pct: f64,
    queue: VecDeque<(SchedulerPriority, Message)>,
    metrics: SchedulerMetrics,
}

impl BandwidthScheduler {
    pub fn new(cfg: &crate::config::MeshConfig) -> Self {
        Self {
            max_queue_size: cfg.max_queue_size,
            congestion_utilization: cfg.congestion_utilization_pct,
            congestion_packet_loss: cfg.congestion_packet_loss_pct,
            congestion_queue_pct: cfg.congestion_queue_pct,
            queue: VecDeque::new(),
            metrics: SchedulerMetrics::default(),
        }
    }

    fn congested(&self) -> bool {
        self.metrics.utilization > self.congestion_utilization
            || self.metrics.packet_loss > self.congestion_packet_loss
            || self.queue.len() as f64 > self.congestion_queue_pct * self.max_queue_size as f64
    }

    /// Admit `msg` at `priority` into the queue. Congestion does not
    /// reject admission outright; it instead gates `next()` so only
    /// CRITICAL messages drain while congested (§5). Queue overflow still
    /// evicts the lowest-priority incumbent only if the new arrival
    /// strictly outranks it (§5 Backpressure).
    pub fn schedule(&mut self, priority: SchedulerPriority, msg: Message) -> bool {
        if self.queue.len() < self.max_queue_size {
            self.queue.push_back((priority, msg));
            self.sort_by_priority();
            return true;
        }
        let worst_index = self
            .queue
            .iter()
            .enumerate()
            .max_by_key(|(_, (p, _))| *p)
            .map(|(i, _)| i);
        if let Some(idx) = worst_index {
            if self.queue[idx].0 > priority {
                self.queue.remove(idx);
                self.queue.push_back((priority, msg));
                self.sort_by_priority();
                return true;
            }
        }
        false
    }

    fn sort_by_priority(&mut self) {
        let mut items: Vec<_> = self.queue.drain(..).collect();
        items.sort_by_key(|(p, _)| *p);
        self.queue = items.into();
    }

    /// Pop the next message to send. While congested, only CRITICAL
    /// messages are released; others stay queued until congestion clears.
    pub fn next(&mut self) -> Option<Message> {
        if self.congested() {
            let idx = self
                .queue
                .iter()
                .position(|(p, _)| *p == SchedulerPriority::Critical)?;
            return Some(self.queue.remove(idx).unwrap().1);
        }
        self.queue.pop_front().map(|(_, m)| m)
    }

    pub fn update_bandwidth(&mut self, bps: f64) {
        self.metrics.available_bandwidth_bps = bps;
    }

    pub fn record_send(&mut self, bytes: u64) {
        self.metrics.bytes_sent += bytes;
    }

    /// Recompute derived rate metrics: packet loss above 5% shrinks
    /// available bandwidth by 0.8x; utilization below 50% grows it 1.1x.
    pub fn update_metrics(&mut self, utilization: f64, packet_loss: f64) {
        self.metrics.utilization = utilization;
        self.metrics.packet_loss = packet_loss;
        if packet_loss > 0.05 {
            self.metrics.available_bandwidth_bps *= 0.8;
        }
        if utilization < 0.5 {
            self.metrics.available_bandwidth_bps *= 1.1;
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::{Keypair, Signature};
    use crate::message::{Header, HEADER_VERSION};

    fn msg(kind: MessageType) -> Message {
        let kp = Keypair::generate();
        Message {
            header: Header {
                version: HEADER_VERSION,
                msg_type: kind,
                ttl: 5,
                timestamp_ms: 0,
                sender_pubkey: kp.public_key(),
                signature: Signature::zeroed(),
                recipient: None,
            },
            payload: vec![],
        }
    }

    #[test]
    fn higher_priority_drains_first() {
        let cfg = crate::config::MeshConfig::default();
        let mut sched = BandwidthScheduler::new(&cfg);
        assert!(sched.schedule(SchedulerPriority::Low, msg(MessageType::FileChunk)));
        assert!(sched.schedule(SchedulerPriority::Critical, msg(MessageType::ControlPing)));
        let first = sched.next().unwrap();
        assert_eq!(first.header.msg_type, MessageType::ControlPing);
    }

    #[test]
    fn escalation_preserves_messages_while_promoting_lane() {
        let mut q = EscalatingQueue::new(Duration::from_millis(0));
        q.push(msg(MessageType::FileMetadata), None);
        assert_eq!(q.len(), 1);
        std::thread::sleep(Duration::from_millis(2));
        q.run_escalation(Instant::now());
        assert_eq!(q.len(), 1, "escalation must not drop messages");
        assert!(q.pop().is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn overflow_drops_new_arrival_when_not_higher_priority() {
        let mut cfg = crate::config::MeshConfig::default();
        cfg.max_queue_size = 1;
        let mut sched = BandwidthScheduler::new(&cfg);
        assert!(sched.schedule(SchedulerPriority::High, msg(MessageType::Text)));
        assert!(!sched.schedule(SchedulerPriority::Low, msg(MessageType::FileChunk)));
        assert!(sched.schedule(SchedulerPriority::Critical, msg(MessageType::ControlPing)));
    }
}
