//! Every tunable named by the design spec, collected into one config
//! struct with the defaults the spec prescribes. Loadable from TOML,
//! matching the teacher's layered `mesh/config.rs` pattern.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    // ---- Routing table ----
    pub max_routes: usize,
    pub route_ttl: Duration,
    pub max_seen_cache: usize,
    pub seen_cache_ttl: Duration,

    // ---- Kademlia DHT ----
    pub k_bucket_size: usize,
    pub alpha: usize,
    pub dht_query_timeout: Duration,
    pub dht_max_rounds: usize,

    // ---- Relay ----
    pub flood_rate_limit: usize,
    pub flood_threshold: usize,
    pub max_loop_cache: usize,
    pub store_timeout: Duration,
    pub max_stored_messages: usize,
    pub retry_interval: Duration,
    pub retry_backoff_base: Duration,
    pub max_retries: u32,
    pub min_fragment: usize,
    pub max_fragment: usize,
    pub reassembly_cap_bytes: usize,
    pub reassembly_ttl: Duration,

    // ---- Gossip ----
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    pub push_pull_ratio: f64,
    pub max_message_age: Duration,
    pub max_digest: usize,
    pub prune_interval: Duration,

    // ---- Priority escalation ----
    pub escalation_threshold: Duration,
    pub escalation_check_interval: Duration,

    // ---- Orchestrator ----
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    pub session_presence_interval: Duration,
    pub offline_threshold: Duration,
    pub poor_threshold: Duration,
    pub offline_disconnect_strikes: u32,

    // ---- Bandwidth scheduler ----
    pub max_queue_size: usize,
    pub congestion_utilization_pct: f64,
    pub congestion_packet_loss_pct: f64,
    pub congestion_queue_pct: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_routes: 10_000,
            route_ttl: Duration::from_secs(3600),
            max_seen_cache: 10_000,
            seen_cache_ttl: Duration::from_secs(600),

            k_bucket_size: 20,
            alpha: 3,
            dht_query_timeout: Duration::from_millis(5000),
            dht_max_rounds: 10,

            flood_rate_limit: 100,
            flood_threshold: 5,
            max_loop_cache: 10_000,
            store_timeout: Duration::from_secs(24 * 3600),
            max_stored_messages: 1000,
            retry_interval: Duration::from_secs(30),
            retry_backoff_base: Duration::from_secs(30),
            max_retries: 10,
            min_fragment: 512,
            max_fragment: 16 * 1024,
            reassembly_cap_bytes: 100 * 1024 * 1024,
            reassembly_ttl: Duration::from_secs(60),

            gossip_interval: Duration::from_secs(1),
            gossip_fanout: 4,
            push_pull_ratio: 0.7,
            max_message_age: Duration::from_secs(60),
            max_digest: 50,
            prune_interval: Duration::from_secs(30),

            escalation_threshold: Duration::from_secs(30),
            escalation_check_interval: Duration::from_secs(5),

            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            session_presence_interval: Duration::from_secs(30),
            offline_threshold: Duration::from_secs(30),
            poor_threshold: Duration::from_secs(10),
            offline_disconnect_strikes: 6,

            max_queue_size: 1000,
            congestion_utilization_pct: 0.8,
            congestion_packet_loss_pct: 0.1,
            congestion_queue_pct: 0.9,
        }
    }
}

impl MeshConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
