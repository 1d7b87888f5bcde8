use crate::clock::Clock;
use crate::cluster::{ClientPool, ClusterConfig, ManifestStore};
use crate::membership::PeerStore;
use crate::storage::{BlobObjects, BlobReader, ByteRange, validate_hash};
use crate::{KeelError, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct OpenBlobOperation {
    config: ClusterConfig,
    local: Arc<dyn BlobObjects>,
    peers: Arc<PeerStore>,
    pool: Arc<ClientPool>,
    manifests: Arc<ManifestStore>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct OpenBlobOperationRequest {
    pub sha512: String,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    Local,
    Peer(String),
}

pub struct OpenBlobOperationResult {
    pub reader: BlobReader,
    pub source: BlobSource,
    /// Size of the whole object.
    pub size_bytes: u64,
    /// The range actually served, clamped to the object.
    pub range: Option<ByteRange>,
}

impl OpenBlobOperation {
    pub fn new(
        config: ClusterConfig,
        local: Arc<dyn BlobObjects>,
        peers: Arc<PeerStore>,
        pool: Arc<ClientPool>,
        manifests: Arc<ManifestStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            local,
            peers,
            pool,
            manifests,
            clock,
        }
    }

    pub async fn run(&self, request: OpenBlobOperationRequest) -> Result<OpenBlobOperationResult> {
        let OpenBlobOperationRequest { sha512, range } = request;
        validate_hash(&sha512)?;

        let manifest = self.manifests.get(&sha512).await?;
        if let Some(manifest) = &manifest
            && manifest.grace_elapsed(self.clock.now(), self.config.grace_period)
        {
            return Err(KeelError::NotFound(format!("object {} was deleted", sha512)));
        }

        let local_size = match self.local.blob_envelope(&sha512).await {
            Ok(envelope) => Some(envelope.size_bytes),
            Err(error) if error.is_not_found() => None,
            Err(error) => return Err(error),
        };
        let size_bytes = match (local_size, &manifest) {
            (Some(size_bytes), _) => size_bytes,
            (None, Some(manifest)) => manifest.size_bytes,
            (None, None) => return Err(KeelError::NotFound(format!("object {}", sha512))),
        };
        let range = range.map(|range| range.resolve(size_bytes)).transpose()?;

        if local_size.is_some() {
            match self.local.open_blob(&sha512, range).await {
                Ok(reader) => {
                    return Ok(OpenBlobOperationResult {
                        reader,
                        source: BlobSource::Local,
                        size_bytes,
                        range,
                    });
                }
                // purged since the stat above
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }

        let Some(manifest) = manifest else {
            return Err(KeelError::NotFound(format!("object {}", sha512)));
        };

        for holder in manifest
            .holders
            .iter()
            .filter(|holder| **holder != self.config.peer_id)
        {
            let Some(peer) = self.peers.peer(holder).await else {
                continue;
            };
            if !self.peers.is_active(&peer.id).await {
                continue;
            }

            let opened = tokio::time::timeout(self.config.push_timeout, async {
                let handle = self.pool.resolve(&peer).await?;
                handle.open_blob(&sha512, range).await
            })
            .await
            .unwrap_or_else(|_| {
                Err(KeelError::Timeout(format!(
                    "open on {} exceeded {:?}",
                    peer.id, self.config.push_timeout
                )))
            });

            match opened {
                Ok(reader) => {
                    tracing::debug!(
                        "Reading object from holder: sha512={} node={}",
                        sha512,
                        peer.id
                    );
                    return Ok(OpenBlobOperationResult {
                        reader,
                        source: BlobSource::Peer(peer.id),
                        size_bytes,
                        range,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        "Holder read failed: node={} sha512={} error={}",
                        peer.id,
                        sha512,
                        error
                    );
                }
            }
        }

        Err(KeelError::Unavailable(format!(
            "no reachable holder for object {}",
            sha512
        )))
    }
}
