//! Groupcast delivery layer.
//!
//! Reliable, deduplicating message delivery inside a group of members:
//! per-sender sequencing, strictly ordered delivery of regular messages,
//! immediate dedup-only delivery of out-of-band messages, gap-driven
//! retransmission and a stability protocol that reclaims buffered history.
//!
//! The core (`engine` and the modules below it) is a set of pure state
//! machines; `runtime` drives one of them per member on a tokio task.
//!
//! Wire format: MessagePack (compact binary).

pub mod config;
pub mod engine;
pub mod error;
pub mod lanes;
pub mod message;
pub mod outbound;
pub mod retransmit;
pub mod runtime;
pub mod stability;
#[cfg(feature = "test-utils")]
pub mod testing;
pub mod types;
pub mod window;

pub use config::DeliveryConfig;
pub use engine::{Counters, DeliveryEngine, EngineAction, EngineStats, ProtocolEvent};
pub use error::ProtocolError;
pub use lanes::{Delivery, DeliveryOrdering, OrderedLane, UnorderedLane};
pub use message::{DataMessage, DigestEntry, Packet, RetransmitRequest, StabilityDigest};
pub use outbound::{SentBuffer, SequenceAssigner};
pub use retransmit::{GapAction, RetransmitRequester};
pub use runtime::{
    GroupRuntime, MemoryEndpoint, MemoryNetwork, RuntimeChannels, RuntimeHandle, Transport,
};
pub use stability::StabilityTracker;
pub use types::{MemberId, MessageClass, Scope, View, WindowKey};
pub use window::{Classification, ReceiveWindow, Receipt};
