use crate::Result;
use crate::clock::Clock;
use crate::cluster::ManifestStore;
use crate::storage::validate_hash;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct DeleteBlobOperation {
    manifests: Arc<ManifestStore>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct DeleteBlobOperationRequest {
    pub sha512: String,
}

#[derive(Debug, Clone)]
pub struct DeleteBlobOperationResult {
    pub sha512: String,
    pub tombstoned_at: DateTime<Utc>,
}

impl DeleteBlobOperation {
    pub fn new(manifests: Arc<ManifestStore>, clock: Arc<dyn Clock>) -> Self {
        Self { manifests, clock }
    }

    /// Tombstones the object. Bytes stay on every holder until the purge
    /// worker finds the grace period elapsed.
    pub async fn run(
        &self,
        request: DeleteBlobOperationRequest,
    ) -> Result<DeleteBlobOperationResult> {
        let DeleteBlobOperationRequest { sha512 } = request;
        validate_hash(&sha512)?;

        let manifest = self.manifests.tombstone(&sha512, self.clock.now()).await?;
        let tombstoned_at = manifest.tombstoned_at.unwrap_or_else(|| self.clock.now());

        tracing::info!(
            "Tombstoned object: sha512={} tombstoned_at={}",
            sha512,
            tombstoned_at
        );

        Ok(DeleteBlobOperationResult {
            sha512,
            tombstoned_at,
        })
    }
}
