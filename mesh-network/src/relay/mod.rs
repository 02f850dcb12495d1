//! Message Relay (§4.3): ingress pipeline, Smart Flood forwarding,
//! offline store-and-forward, and fragmentation/reassembly.

pub mod forward;
pub mod fragment;
pub mod ingress;
pub mod loop_cache;
pub mod rate_limiter;
pub mod store_forward;

pub use fragment::{Fragment, FragmentGroupId, Reassembler};
pub use ingress::{AcceptedMessage, DropReason, IngressOutcome, IngressPipeline};
pub use store_forward::{ForwardSender, RetryDisposition, StoreAndForward};
