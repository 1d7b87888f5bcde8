use crate::cluster::{ClientPool, ClusterConfig, ManifestStore, ObjectLocks, ReplicationManifest};
use crate::membership::{PeerRecord, PeerState, PeerStore};
use crate::storage::BlobObjects;
use crate::{KeelError, Result};
use std::sync::Arc;

/// Pulls objects this node does not hold yet from their holders.
#[derive(Clone)]
pub struct FetchObjectsOperation {
    config: ClusterConfig,
    local: Arc<dyn BlobObjects>,
    peers: Arc<PeerStore>,
    pool: Arc<ClientPool>,
    manifests: Arc<ManifestStore>,
    locks: Arc<ObjectLocks>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchObjectsOperationResult {
    pub fetched: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl FetchObjectsOperation {
    pub fn new(
        config: ClusterConfig,
        local: Arc<dyn BlobObjects>,
        peers: Arc<PeerStore>,
        pool: Arc<ClientPool>,
        manifests: Arc<ManifestStore>,
        locks: Arc<ObjectLocks>,
    ) -> Self {
        Self {
            config,
            local,
            peers,
            pool,
            manifests,
            locks,
        }
    }

    pub async fn run(&self) -> Result<FetchObjectsOperationResult> {
        let mut result = FetchObjectsOperationResult::default();
        let local_id = self.config.peer_id.as_str();

        for manifest in self.manifests.list().await? {
            if manifest.tombstoned || manifest.is_holder(local_id) {
                continue;
            }

            let _guard = self.locks.lock(&manifest.sha512).await;
            let present = match self.local.blob_envelope(&manifest.sha512).await {
                Ok(_) => true,
                Err(error) if error.is_not_found() => false,
                Err(error) => {
                    result
                        .errors
                        .push(format!("{}: {}", manifest.sha512, error));
                    continue;
                }
            };

            if !present {
                let holders = self.active_holders(&manifest).await;
                if holders.is_empty() {
                    result.skipped += 1;
                    continue;
                }

                if let Err(error) = self.fetch_from_holders(&manifest, holders).await {
                    if error.is_retryable() {
                        tracing::warn!(
                            "Fetch failed, will retry: sha512={} error={}",
                            manifest.sha512,
                            error
                        );
                    } else {
                        tracing::error!(
                            "Fetch failed: sha512={} error={}",
                            manifest.sha512,
                            error
                        );
                    }
                    result
                        .errors
                        .push(format!("{}: {}", manifest.sha512, error));
                    continue;
                }
            }

            match self.manifests.add_holder(&manifest.sha512, local_id).await {
                Ok(Some(_)) => {
                    tracing::info!("Replicated object: sha512={}", manifest.sha512);
                    result.fetched += 1;
                }
                Ok(None) => {
                    tracing::debug!(
                        "Manifest removed while fetching: sha512={}",
                        manifest.sha512
                    );
                    result.skipped += 1;
                }
                Err(error) => {
                    result
                        .errors
                        .push(format!("{}: {}", manifest.sha512, error));
                }
            }
        }

        Ok(result)
    }

    async fn active_holders(&self, manifest: &ReplicationManifest) -> Vec<PeerRecord> {
        let mut holders = Vec::new();
        for holder in &manifest.holders {
            if *holder == self.config.peer_id {
                continue;
            }
            if let Some(peer) = self.peers.peer(holder).await
                && peer.state == PeerState::Active
            {
                holders.push(peer);
            }
        }
        holders
    }

    /// Tries each holder in turn. Content that does not hash to the manifest's
    /// digest is never stored.
    async fn fetch_from_holders(
        &self,
        manifest: &ReplicationManifest,
        holders: Vec<PeerRecord>,
    ) -> Result<()> {
        let sha512 = manifest.sha512.as_str();
        let mut last_error = None;

        for peer in holders {
            let fetched = tokio::time::timeout(self.config.push_timeout, async {
                let handle = self.pool.resolve(&peer).await?;
                let reader = handle.open_blob(sha512, None).await?;
                self.local.write_blob(reader, Some(sha512)).await
            })
            .await
            .unwrap_or_else(|_| {
                Err(KeelError::Timeout(format!(
                    "fetch from {} exceeded {:?}",
                    peer.id, self.config.push_timeout
                )))
            });

            match fetched {
                Ok(_) => return Ok(()),
                Err(error @ KeelError::HashMismatch { .. }) => {
                    tracing::warn!(
                        "Discarding corrupt copy: node={} sha512={} error={}",
                        peer.id,
                        sha512,
                        error
                    );
                    last_error = Some(error);
                }
                Err(error) if error.is_not_found() => {
                    tracing::debug!(
                        "Holder has no copy yet: node={} sha512={}",
                        peer.id,
                        sha512
                    );
                    last_error = Some(error);
                }
                Err(error) => {
                    tracing::warn!(
                        "Holder fetch failed: node={} sha512={} error={}",
                        peer.id,
                        sha512,
                        error
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            KeelError::Unavailable(format!("no holder could serve object {}", sha512))
        }))
    }
}
