//! Mesh Core: routing table, Kademlia DHT, message relay, and gossip
//! engine for a decentralized peer-to-peer mesh, wired together by the
//! `node` orchestrator.

pub mod config;
pub mod dht;
pub mod error;
pub mod gossip;
pub mod message;
pub mod node;
pub mod persistence;
pub mod relay;
pub mod routing;
pub mod rpc;
pub mod scheduler;
pub mod stats;
pub mod transport;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use message::{Message, MessageType};
pub use node::{MessageListener, Node, SessionInvalidatedCallback};
pub use stats::{NodeStats, NodeStatsSnapshot};
pub use transport::{Transport, TransportCallbacks, TransportManager, TransportTag};
