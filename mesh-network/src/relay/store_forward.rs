//! Offline store-and-forward (§4.3 "Store-and-forward").

use async_trait::async_trait;
use mesh_identity::NodeId;
use std::time::SystemTime;

use crate::config::MeshConfig;
use crate::error::MeshResult;
use crate::message::Message;
use crate::persistence::{Priority, StoredMessage, StoredMessageAdapter};
use crate::routing::table::RoutingTable;

/// Attempts delivery of a single message to a single peer over the wire;
/// implemented by whatever wires the relay to a `TransportManager`.
#[async_trait]
pub trait ForwardSender: Send + Sync {
    async fn attempt_delivery(&self, peer: NodeId, message: &Message) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Delivered,
    StillPending,
    Expired,
    RetriesExhausted,
}

pub struct StoreAndForward<'a> {
    adapter: &'a dyn StoredMessageAdapter,
    cfg: &'a MeshConfig,
}

impl<'a> StoreAndForward<'a> {
    pub fn new(adapter: &'a dyn StoredMessageAdapter, cfg: &'a MeshConfig) -> Self {
        Self { adapter, cfg }
    }

    /// Persists `message` for later delivery to `dest`, evicting the
    /// oldest-by-`last_attempt` entry if the store is at its cap.
    pub async fn store(
        &self,
        message: Message,
        dest: NodeId,
        priority: Priority,
        now: SystemTime,
    ) -> MeshResult<()> {
        if self.adapter.size().await? >= self.cfg.max_stored_messages {
            self.evict_oldest().await?;
        }
        let hash = message.content_hash();
        let stored = StoredMessage {
            message,
            destination: dest,
            attempts: 0,
            last_attempt: None,
            expires_at: now + self.cfg.store_timeout,
            priority,
            route_attempts: Vec::new(),
        };
        self.adapter.save(hash, stored).await
    }

    async fn evict_oldest(&self) -> MeshResult<()> {
        let all = self.adapter.get_all().await?;
        if let Some((hash, _)) = all.into_iter().min_by_key(|(_, m)| m.last_attempt) {
            self.adapter.remove(&hash).await?;
        }
        Ok(())
    }

    fn backoff_elapsed(&self, stored: &StoredMessage, now: SystemTime) -> bool {
        let Some(last) = stored.last_attempt else { return true };
        let backoff = self.cfg.retry_backoff_base * 2u32.saturating_pow(stored.attempts);
        now.duration_since(last).unwrap_or_default() >= backoff
    }

    /// One retry-scheduler tick: iterates a snapshot of persisted entries
    /// so concurrent additions during the scan never starve existing ones.
    pub async fn run_retry_cycle(
        &self,
        routing: &mut RoutingTable,
        sender: &dyn ForwardSender,
        now: SystemTime,
    ) -> MeshResult<Vec<(mesh_crypto::ContentHash, RetryDisposition)>> {
        let snapshot = self.adapter.get_all().await?;
        let mut report = Vec::with_capacity(snapshot.len());

        for (hash, mut stored) in snapshot {
            if stored.expires_at <= now {
                self.adapter.remove(&hash).await?;
                report.push((hash, RetryDisposition::Expired));
                continue;
            }
            if !self.backoff_elapsed(&stored, now) {
                continue;
            }

            stored.attempts += 1;
            stored.last_attempt = Some(now);

            let delivered = if let Some(next_hop) = routing.get_next_hop(&stored.destination, now) {
                sender.attempt_delivery(next_hop, &stored.message).await
            } else {
                let mut delivered = false;
                let untried: Vec<NodeId> = routing
                    .connected_peers()
                    .map(|p| p.id)
                    .filter(|id| !stored.route_attempts.contains(id))
                    .collect();
                for peer in untried {
                    stored.route_attempts.push(peer);
                    if sender.attempt_delivery(peer, &stored.message).await {
                        delivered = true;
                        break;
                    }
                }
                delivered
            };

            if delivered {
                self.adapter.remove(&hash).await?;
                report.push((hash, RetryDisposition::Delivered));
            } else if stored.attempts >= self.cfg.max_retries {
                self.adapter.remove(&hash).await?;
                report.push((hash, RetryDisposition::RetriesExhausted));
            } else {
                self.adapter.save(hash, stored).await?;
                report.push((hash, RetryDisposition::StillPending));
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, MessageType, HEADER_VERSION};
    use crate::persistence::memory::InMemoryStoredMessages;
    use mesh_crypto::{Keypair, Signature};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample_message() -> Message {
        let kp = Keypair::generate();
        let mut msg = Message {
            header: Header {
                version: HEADER_VERSION,
                msg_type: MessageType::Text,
                ttl: 5,
                timestamp_ms: 0,
                sender_pubkey: kp.public_key(),
                signature: Signature::zeroed(),
                recipient: None,
            },
            payload: b"hi".to_vec(),
        };
        msg.sign(&kp);
        msg
    }

    struct AlwaysSucceeds(AtomicBool);

    #[async_trait]
    impl ForwardSender for AlwaysSucceeds {
        async fn attempt_delivery(&self, _peer: NodeId, _message: &Message) -> bool {
            self.0.store(true, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn stored_message_delivers_once_route_exists() {
        let cfg = MeshConfig::default();
        let adapter = InMemoryStoredMessages::default();
        let saf = StoreAndForward::new(&adapter, &cfg);
        let now = SystemTime::now();
        let dest = NodeId::from_bytes([9; 32]);
        saf.store(sample_message(), dest, Priority::Normal, now).await.unwrap();
        assert_eq!(adapter.size().await.unwrap(), 1);

        let mut routing = RoutingTable::new(NodeId::from_bytes([0; 32]), &cfg);
        let kp = Keypair::generate();
        routing.add_peer(crate::routing::Peer::new(
            dest,
            kp.public_key(),
            crate::transport::TransportTag::Local,
            now,
        ));

        let sender = AlwaysSucceeds(AtomicBool::new(false));
        let report = saf.run_retry_cycle(&mut routing, &sender, now).await.unwrap();
        assert_eq!(report[0].1, RetryDisposition::Delivered);
        assert_eq!(adapter.size().await.unwrap(), 0);
    }

    struct AlwaysFails;

    #[async_trait]
    impl ForwardSender for AlwaysFails {
        async fn attempt_delivery(&self, _peer: NodeId, _message: &Message) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn exceeding_max_retries_deletes_and_reports_exhaustion() {
        let mut cfg = MeshConfig::default();
        cfg.max_retries = 1;
        cfg.retry_backoff_base = std::time::Duration::from_secs(0);
        let adapter = InMemoryStoredMessages::default();
        let saf = StoreAndForward::new(&adapter, &cfg);
        let now = SystemTime::now();
        let dest = NodeId::from_bytes([9; 32]);
        saf.store(sample_message(), dest, Priority::Normal, now).await.unwrap();

        let mut routing = RoutingTable::new(NodeId::from_bytes([0; 32]), &cfg);
        let report = saf.run_retry_cycle(&mut routing, &AlwaysFails, now).await.unwrap();
        assert_eq!(report[0].1, RetryDisposition::RetriesExhausted);
        assert_eq!(adapter.size().await.unwrap(), 0);
    }
}
