use crate::Result;
use crate::cluster::ManifestStore;
use crate::storage::Envelope;
use std::sync::Arc;

#[derive(Clone)]
pub struct ListBlobsOperation {
    manifests: Arc<ManifestStore>,
}

#[derive(Debug, Clone)]
pub struct ListBlobsOperationResult {
    pub items: Vec<Envelope>,
}

impl ListBlobsOperation {
    pub fn new(manifests: Arc<ManifestStore>) -> Self {
        Self { manifests }
    }

    pub async fn run(&self) -> Result<ListBlobsOperationResult> {
        let mut items: Vec<Envelope> = self
            .manifests
            .list()
            .await?
            .into_iter()
            .filter(|manifest| !manifest.tombstoned)
            .map(|manifest| Envelope {
                sha512: manifest.sha512,
                size_bytes: manifest.size_bytes,
                created_at: manifest.created_at,
            })
            .collect();
        items.sort_by(|left, right| left.sha512.cmp(&right.sha512));

        Ok(ListBlobsOperationResult { items })
    }
}
