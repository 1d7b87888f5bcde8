use chrono::{DateTime, Utc};
use keel_core::{Envelope, PeerState};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: String,
    pub(crate) node_id: String,
    pub(crate) active_peers: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct PeersResponse {
    pub(crate) node_id: String,
    pub(crate) peers: Vec<PeerItem>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PeerItem {
    pub(crate) id: String,
    pub(crate) advertise_addr: String,
    pub(crate) state: PeerState,
    pub(crate) missed_heartbeats: u32,
    pub(crate) last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PutObjectResponse {
    pub(crate) sha512: String,
    pub(crate) size_bytes: u64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) holders: Vec<String>,
    pub(crate) required_replicas: usize,
    pub(crate) committed_replicas: usize,
    pub(crate) degraded: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListResponse {
    pub(crate) items: Vec<Envelope>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteResponse {
    pub(crate) sha512: String,
    pub(crate) tombstoned_at: DateTime<Utc>,
}
