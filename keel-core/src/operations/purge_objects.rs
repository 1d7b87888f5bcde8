use crate::Result;
use crate::clock::Clock;
use crate::cluster::{ClusterConfig, HolderRelease, ManifestStore, ObjectLocks};
use crate::storage::BlobObjects;
use std::sync::Arc;

/// Removes this node's copy of tombstoned objects once their grace period
/// has elapsed. The last holder to leave removes the manifest.
#[derive(Clone)]
pub struct PurgeObjectsOperation {
    config: ClusterConfig,
    local: Arc<dyn BlobObjects>,
    manifests: Arc<ManifestStore>,
    locks: Arc<ObjectLocks>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct PurgeObjectsOperationResult {
    pub purged: usize,
    pub pending: usize,
    pub removed_manifests: usize,
    pub errors: Vec<String>,
}

impl PurgeObjectsOperation {
    pub fn new(
        config: ClusterConfig,
        local: Arc<dyn BlobObjects>,
        manifests: Arc<ManifestStore>,
        locks: Arc<ObjectLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            local,
            manifests,
            locks,
            clock,
        }
    }

    pub async fn run(&self) -> Result<PurgeObjectsOperationResult> {
        let mut result = PurgeObjectsOperationResult::default();
        let now = self.clock.now();
        let local_id = self.config.peer_id.as_str();

        for manifest in self.manifests.list().await? {
            if !manifest.tombstoned {
                continue;
            }
            if !manifest.grace_elapsed(now, self.config.grace_period) {
                result.pending += 1;
                continue;
            }

            let _guard = self.locks.lock(&manifest.sha512).await;

            let has_local = match self.local.blob_envelope(&manifest.sha512).await {
                Ok(_) => true,
                Err(error) if error.is_not_found() => false,
                Err(error) => {
                    result
                        .errors
                        .push(format!("{}: {}", manifest.sha512, error));
                    continue;
                }
            };
            if !has_local && !manifest.is_holder(local_id) {
                continue;
            }

            let release = match self.manifests.release_holder(&manifest.sha512, local_id).await {
                Ok(release) => release,
                Err(error) => {
                    result
                        .errors
                        .push(format!("{}: {}", manifest.sha512, error));
                    continue;
                }
            };

            match release {
                HolderRelease::Skipped => {
                    tracing::debug!(
                        "Object was rewritten after delete, keeping: sha512={}",
                        manifest.sha512
                    );
                    continue;
                }
                HolderRelease::ManifestRemoved => result.removed_manifests += 1,
                HolderRelease::Released | HolderRelease::Missing => {}
            }

            if has_local {
                match self.local.delete_blob(&manifest.sha512).await {
                    Ok(()) => {
                        tracing::info!("Purged object: sha512={}", manifest.sha512);
                        result.purged += 1;
                    }
                    Err(error) if error.is_not_found() => {}
                    Err(error) => {
                        result
                            .errors
                            .push(format!("{}: {}", manifest.sha512, error));
                    }
                }
            }
        }

        Ok(result)
    }
}
