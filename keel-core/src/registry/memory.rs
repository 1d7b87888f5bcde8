use super::{MetadataBackend, Versioned};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Versioned>,
    next_version: u64,
}

/// In-process backend. One instance can be shared by several nodes living in
/// the same process.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        new_value: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let current_version = state.entries.get(key).map(|entry| entry.version);
        if current_version != expected_version {
            return Ok(false);
        }

        match new_value {
            Some(value) => {
                // versions never repeat, even across delete and re-create
                state.next_version += 1;
                let version = state.next_version;
                state
                    .entries
                    .insert(key.to_string(), Versioned { value, version });
            }
            None => {
                state.entries.remove(key);
            }
        }

        Ok(true)
    }
}
