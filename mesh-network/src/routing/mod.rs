pub mod peer;
pub mod route;
pub mod seen_cache;
pub mod table;

pub use peer::{Peer, PeerCapabilities, PeerState};
pub use route::{Route, RouteMetrics};
pub use seen_cache::SeenCache;
pub use table::{RankedPeer, RoutingTable};
