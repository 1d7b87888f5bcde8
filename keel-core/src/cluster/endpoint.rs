use super::locks::ObjectLocks;
use crate::operations::{DeleteBlobOperation, DeleteBlobOperationRequest};
use crate::storage::{BlobObjects, BlobReader, ByteRange, Envelope, validate_hash};
use crate::{KeelError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// What this node serves to other peers over the internal protocol.
///
/// Reads and listings go straight to the local store. Replica pushes are
/// written under the per-hash lock the purge worker holds while it releases
/// this node as a holder and removes the bytes. Writers clear the tombstone
/// before pushing, so a push that waited on a purge writes fresh bytes after
/// the removal. Deletes tombstone through the cluster; peers never drop
/// bytes on request.
pub struct PeerEndpoint {
    local: Arc<dyn BlobObjects>,
    locks: Arc<ObjectLocks>,
    delete_blob_operation: DeleteBlobOperation,
}

impl PeerEndpoint {
    pub fn new(
        local: Arc<dyn BlobObjects>,
        locks: Arc<ObjectLocks>,
        delete_blob_operation: DeleteBlobOperation,
    ) -> Self {
        Self {
            local,
            locks,
            delete_blob_operation,
        }
    }
}

#[async_trait]
impl BlobObjects for PeerEndpoint {
    async fn write_blob(
        &self,
        body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope> {
        let Some(sha512) = expected_sha512 else {
            return Err(KeelError::InvalidRequest(
                "replica pushes must name their sha512".to_string(),
            ));
        };
        validate_hash(sha512)?;

        let _guard = self.locks.lock(sha512).await;
        self.local.write_blob(body, Some(sha512)).await
    }

    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader> {
        self.local.open_blob(sha512, range).await
    }

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope> {
        self.local.blob_envelope(sha512).await
    }

    async fn delete_blob(&self, sha512: &str) -> Result<()> {
        self.delete_blob_operation
            .run(DeleteBlobOperationRequest {
                sha512: sha512.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<Envelope>> {
        self.local.list_blobs().await
    }
}
