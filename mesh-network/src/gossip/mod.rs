//! Gossip Protocol (§4.4): epidemic push/pull dissemination with
//! anti-entropy digest exchange as a scalable complement to flood.

pub mod engine;
pub mod store;

pub use engine::{GossipEngine, GossipTransport, RoundMode, RoundReport};
pub use store::{GossipMessage, GossipState};
