//! Cluster layer: replication manifests, peer handles and the node facade

pub mod blob_cluster;
pub mod client;
pub mod endpoint;
pub mod locks;
pub mod manifest;
pub mod pool;
pub mod types;

pub use blob_cluster::BlobCluster;
pub use client::{CREATED_AT_HEADER, PeerClient, SHA512_HEADER, SIZE_HEADER};
pub use endpoint::PeerEndpoint;
pub use locks::ObjectLocks;
pub use manifest::{HolderRelease, ManifestStore};
pub use pool::{ClientPool, HttpPeerConnector, PeerConnector};
pub use types::{ClusterConfig, ReplicationManifest, ReplicationMode};

#[cfg(test)]
mod tests;
