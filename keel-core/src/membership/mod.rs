//! Peer membership: heartbeat records and liveness tracking

pub mod liveness;
pub mod store;

pub use liveness::{PeerState, classify, missed_heartbeats};
pub use store::{MembershipChange, MembershipEvent, PeerRecord, PeerStore};
