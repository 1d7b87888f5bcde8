//! Metadata backend for peer records and replication manifests
//!
//! A generic key/value store with a per-key compare-and-swap. Every
//! read-modify-write in the cluster goes through [`update_record`], which
//! retries on conflict with a fresh read.

pub mod factory;
pub mod memory;
pub mod sqlite;

use crate::error::{KeelError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use factory::BackendBuilder;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

pub const PEER_KEY_PREFIX: &str = "peer/";
pub const OBJECT_KEY_PREFIX: &str = "object/";

pub fn peer_key(peer_id: &str) -> String {
    format!("{}{}", PEER_KEY_PREFIX, peer_id)
}

pub fn object_key(sha512: &str) -> String {
    format!("{}{}", OBJECT_KEY_PREFIX, sha512)
}

/// A stored value together with the version a CAS must present to replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

#[async_trait]
pub trait MetadataBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Replaces the value at `key` only if its current version equals
    /// `expected_version` (`None` means the key must be absent). A `None`
    /// value deletes the key. Returns false when the expectation failed.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        new_value: Option<Vec<u8>>,
    ) -> Result<bool>;
}

/// Outcome of an update closure passed to [`update_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate<T> {
    Put(T),
    Delete,
    Keep,
}

pub async fn get_record<T: DeserializeOwned>(
    backend: &dyn MetadataBackend,
    key: &str,
) -> Result<Option<T>> {
    match backend.get(key).await? {
        Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
        None => Ok(None),
    }
}

/// Decodes every entry under `prefix`. Undecodable entries are skipped.
pub async fn list_records<T: DeserializeOwned>(
    backend: &dyn MetadataBackend,
    prefix: &str,
) -> Result<Vec<(String, T)>> {
    let entries = backend.list(prefix).await?;
    let mut records = Vec::with_capacity(entries.len());

    for (key, entry) in entries {
        match serde_json::from_slice(&entry.value) {
            Ok(record) => records.push((key, record)),
            Err(error) => {
                tracing::warn!("Skipping undecodable record: key={} error={}", key, error);
            }
        }
    }

    Ok(records)
}

/// Bounded optimistic read-modify-write of one JSON record.
///
/// `update` sees the freshest decoded value on every attempt and must be
/// free of side effects. Returns the record as it stands after the call.
pub async fn update_record<T, F>(
    backend: &dyn MetadataBackend,
    key: &str,
    max_attempts: usize,
    mut update: F,
) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Result<RecordUpdate<T>>,
{
    for _ in 0..max_attempts.max(1) {
        let current = backend.get(key).await?;
        let expected_version = current.as_ref().map(|entry| entry.version);
        let decoded = match &current {
            Some(entry) => Some(serde_json::from_slice::<T>(&entry.value)?),
            None => None,
        };

        match update(decoded)? {
            RecordUpdate::Keep => {
                return match current {
                    Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
                    None => Ok(None),
                };
            }
            RecordUpdate::Put(record) => {
                let encoded = serde_json::to_vec(&record)?;
                if backend
                    .compare_and_swap(key, expected_version, Some(encoded))
                    .await?
                {
                    return Ok(Some(record));
                }
            }
            RecordUpdate::Delete => {
                if expected_version.is_none() {
                    return Ok(None);
                }
                if backend.compare_and_swap(key, expected_version, None).await? {
                    return Ok(None);
                }
            }
        }

        tracing::debug!("CAS conflict, retrying: key={}", key);
    }

    Err(KeelError::Conflict {
        key: key.to_string(),
        attempts: max_attempts.max(1),
    })
}
