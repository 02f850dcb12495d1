//! Gossip state: known messages (capped by age) and per-peer activity
//! timestamps, backing anti-entropy digest exchange (§4.4).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use mesh_crypto::ContentHash;
use mesh_identity::NodeId;

use crate::message::Message;

#[derive(Debug, Clone)]
pub struct GossipMessage {
    pub content_hash: ContentHash,
    pub timestamp_ms: u64,
    pub message: Message,
    pub received_at: SystemTime,
}

#[derive(Default)]
pub struct GossipState {
    messages: HashMap<ContentHash, GossipMessage>,
    peer_last_seen: HashMap<NodeId, SystemTime>,
}

impl GossipState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.messages.contains_key(hash)
    }

    /// Records a message as known, idempotent on its content hash.
    pub fn record_message(&mut self, message: Message, now: SystemTime) {
        let hash = message.content_hash();
        self.messages.entry(hash).or_insert(GossipMessage {
            content_hash: hash,
            timestamp_ms: message.header.timestamp_ms,
            message,
            received_at: now,
        });
    }

    pub fn record_peer_activity(&mut self, peer: NodeId, now: SystemTime) {
        self.peer_last_seen.insert(peer, now);
    }

    /// Peers with activity within `window` of `now`.
    pub fn active_peers(&self, now: SystemTime, window: Duration) -> Vec<NodeId> {
        self.peer_last_seen
            .iter()
            .filter(|(_, &last)| now.duration_since(last).unwrap_or_default() <= window)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn recent_messages(&self, max_age: Duration, now: SystemTime) -> Vec<&GossipMessage> {
        self.messages
            .values()
            .filter(|m| now.duration_since(m.received_at).unwrap_or_default() <= max_age)
            .collect()
    }

    /// Up to `max_digest` of the most recently received message hashes.
    pub fn digest(&self, max_digest: usize, max_age: Duration, now: SystemTime) -> Vec<ContentHash> {
        let mut recent = self.recent_messages(max_age, now);
        recent.sort_by_key(|m| std::cmp::Reverse(m.received_at));
        recent.into_iter().take(max_digest).map(|m| m.content_hash).collect()
    }

    /// Entries in `remote_digest` we don't have locally — what we should
    /// request back.
    pub fn missing(&self, remote_digest: &[ContentHash]) -> Vec<ContentHash> {
        remote_digest.iter().filter(|h| !self.messages.contains_key(h)).copied().collect()
    }

    /// Our recent messages not present in `remote_digest` — what we should
    /// push to a peer that just told us what it has.
    pub fn surplus(&self, remote_digest: &[ContentHash], max_age: Duration, now: SystemTime) -> Vec<Message> {
        let remote: HashSet<ContentHash> = remote_digest.iter().copied().collect();
        self.recent_messages(max_age, now)
            .into_iter()
            .filter(|m| !remote.contains(&m.content_hash))
            .map(|m| m.message.clone())
            .collect()
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&Message> {
        self.messages.get(hash).map(|m| &m.message)
    }

    /// Removes messages older than `max_age`. Returns the number pruned.
    pub fn prune(&mut self, max_age: Duration, now: SystemTime) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, m| now.duration_since(m.received_at).unwrap_or_default() <= max_age);
        before - self.messages.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, MessageType, HEADER_VERSION};
    use mesh_crypto::{Keypair, Signature};

    fn sample(kp: &Keypair) -> Message {
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
            payload: b"gossip".to_vec(),
        };
        msg.sign(kp);
        msg
    }

    #[test]
    fn digest_lists_recent_hashes_only() {
        let mut state = GossipState::new();
        let kp = Keypair::generate();
        let now = SystemTime::now();
        let msg = sample(&kp);
        let hash = msg.content_hash();
        state.record_message(msg, now);
        let digest = state.digest(50, Duration::from_secs(60), now);
        assert_eq!(digest, vec![hash]);

        let later = now + Duration::from_secs(120);
        let digest_later = state.digest(50, Duration::from_secs(60), later);
        assert!(digest_later.is_empty());
    }

    #[test]
    fn missing_and_surplus_are_complementary() {
        let mut local = GossipState::new();
        let mut remote = GossipState::new();
        let now = SystemTime::now();
        let kp = Keypair::generate();
        let shared = sample(&kp);
        let remote_only = sample(&kp);
        local.record_message(shared.clone(), now);
        remote.record_message(shared, now);
        remote.record_message(remote_only.clone(), now);

        let remote_digest = remote.digest(50, Duration::from_secs(60), now);
        let missing = local.missing(&remote_digest);
        assert_eq!(missing, vec![remote_only.content_hash()]);

        let local_digest = local.digest(50, Duration::from_secs(60), now);
        let surplus = remote.surplus(&local_digest, Duration::from_secs(60), now);
        assert_eq!(surplus.len(), 1);
        assert_eq!(surplus[0].content_hash(), remote_only.content_hash());
    }

    #[test]
    fn prune_removes_old_messages() {
        let mut state = GossipState::new();
        let kp = Keypair::generate();
        let now = SystemTime::now();
        state.record_message(sample(&kp), now);
        let later = now + Duration::from_secs(100);
        let pruned = state.prune(Duration::from_secs(60), later);
        assert_eq!(pruned, 1);
        assert!(state.is_empty());
    }
}
