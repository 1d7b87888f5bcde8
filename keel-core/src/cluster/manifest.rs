use super::types::ReplicationManifest;
use crate::registry::{
    MetadataBackend, OBJECT_KEY_PREFIX, RecordUpdate, get_record, list_records, object_key,
    update_record,
};
use crate::storage::Envelope;
use crate::{KeelError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Replication manifests in the metadata backend. Every mutation is a CAS
/// merge against the freshest record, never a blind overwrite.
pub struct ManifestStore {
    backend: Arc<dyn MetadataBackend>,
    max_attempts: usize,
}

impl ManifestStore {
    pub fn new(backend: Arc<dyn MetadataBackend>, max_attempts: usize) -> Self {
        Self {
            backend,
            max_attempts,
        }
    }

    pub async fn get(&self, sha512: &str) -> Result<Option<ReplicationManifest>> {
        get_record(self.backend.as_ref(), &object_key(sha512)).await
    }

    /// All manifests ordered by content hash.
    pub async fn list(&self) -> Result<Vec<ReplicationManifest>> {
        let records =
            list_records::<ReplicationManifest>(self.backend.as_ref(), OBJECT_KEY_PREFIX).await?;
        Ok(records.into_iter().map(|(_, manifest)| manifest).collect())
    }

    /// Creates the manifest or merges `holders` into it. A tombstone left by
    /// an earlier delete of the same content is cleared.
    pub async fn record_write(
        &self,
        envelope: &Envelope,
        holders: &BTreeSet<String>,
        write_factor: usize,
    ) -> Result<ReplicationManifest> {
        let updated = update_record::<ReplicationManifest, _>(
            self.backend.as_ref(),
            &object_key(&envelope.sha512),
            self.max_attempts,
            |current| {
                let manifest = match current {
                    Some(mut existing) => {
                        existing.holders.extend(holders.iter().cloned());
                        existing.write_factor = existing.write_factor.max(write_factor);
                        existing.tombstoned = false;
                        existing.tombstoned_at = None;
                        existing
                    }
                    None => ReplicationManifest {
                        sha512: envelope.sha512.clone(),
                        size_bytes: envelope.size_bytes,
                        created_at: envelope.created_at,
                        holders: holders.clone(),
                        write_factor,
                        tombstoned: false,
                        tombstoned_at: None,
                    },
                };
                Ok(RecordUpdate::Put(manifest))
            },
        )
        .await?;

        updated.ok_or_else(|| {
            KeelError::Internal(format!("manifest vanished after write: {}", envelope.sha512))
        })
    }

    /// Adds `peer_id` to the holders. Returns `None` when the manifest no
    /// longer exists.
    pub async fn add_holder(
        &self,
        sha512: &str,
        peer_id: &str,
    ) -> Result<Option<ReplicationManifest>> {
        self.add_holders(sha512, &BTreeSet::from([peer_id.to_string()]))
            .await
    }

    /// Merges `holders` in without touching the tombstone.
    pub async fn add_holders(
        &self,
        sha512: &str,
        holders: &BTreeSet<String>,
    ) -> Result<Option<ReplicationManifest>> {
        update_record::<ReplicationManifest, _>(
            self.backend.as_ref(),
            &object_key(sha512),
            self.max_attempts,
            |current| match current {
                Some(manifest) if holders.is_subset(&manifest.holders) => {
                    Ok(RecordUpdate::Keep)
                }
                Some(mut manifest) => {
                    manifest.holders.extend(holders.iter().cloned());
                    Ok(RecordUpdate::Put(manifest))
                }
                None => Ok(RecordUpdate::Keep),
            },
        )
        .await
    }

    /// Marks the object deleted. The first tombstone time is kept.
    pub async fn tombstone(
        &self,
        sha512: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplicationManifest> {
        let updated = update_record::<ReplicationManifest, _>(
            self.backend.as_ref(),
            &object_key(sha512),
            self.max_attempts,
            |current| match current {
                Some(manifest) if manifest.tombstoned => Ok(RecordUpdate::Keep),
                Some(mut manifest) => {
                    manifest.tombstoned = true;
                    manifest.tombstoned_at = Some(now);
                    Ok(RecordUpdate::Put(manifest))
                }
                None => Err(KeelError::NotFound(format!("object {}", sha512))),
            },
        )
        .await?;

        updated.ok_or_else(|| KeelError::NotFound(format!("object {}", sha512)))
    }

    /// Removes `peer_id` from the holders of a tombstoned manifest, deleting
    /// the manifest once nobody holds the object.
    pub async fn release_holder(&self, sha512: &str, peer_id: &str) -> Result<HolderRelease> {
        let mut release = HolderRelease::Skipped;
        update_record::<ReplicationManifest, _>(
            self.backend.as_ref(),
            &object_key(sha512),
            self.max_attempts,
            |current| match current {
                Some(manifest) if !manifest.tombstoned => {
                    release = HolderRelease::Skipped;
                    Ok(RecordUpdate::Keep)
                }
                Some(mut manifest) => {
                    manifest.holders.remove(peer_id);
                    if manifest.holders.is_empty() {
                        release = HolderRelease::ManifestRemoved;
                        Ok(RecordUpdate::Delete)
                    } else {
                        release = HolderRelease::Released;
                        Ok(RecordUpdate::Put(manifest))
                    }
                }
                None => {
                    release = HolderRelease::Missing;
                    Ok(RecordUpdate::Keep)
                }
            },
        )
        .await?;

        Ok(release)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderRelease {
    /// The object is no longer tombstoned; nothing changed.
    Skipped,
    /// This peer left the holders; others still hold the object.
    Released,
    /// This peer was the last holder and the manifest was removed.
    ManifestRemoved,
    /// The manifest had already been removed.
    Missing,
}
