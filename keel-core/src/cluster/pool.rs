use super::client::PeerClient;
use crate::Result;
use crate::membership::PeerRecord;
use crate::storage::BlobObjects;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Turns a peer record into a handle speaking the object interface, local
/// or remote.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn BlobObjects>>;
}

/// Connects to other peers over the internal HTTP protocol and short-cuts
/// this node to its local store.
pub struct HttpPeerConnector {
    local_id: String,
    local: Arc<dyn BlobObjects>,
    token: String,
    client: reqwest::Client,
}

impl HttpPeerConnector {
    pub fn new(
        local_id: impl Into<String>,
        local: Arc<dyn BlobObjects>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            local,
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PeerConnector for HttpPeerConnector {
    async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn BlobObjects>> {
        if peer.id == self.local_id {
            return Ok(self.local.clone());
        }

        let client =
            PeerClient::with_client(self.client.clone(), &peer.advertise_addr, self.token.clone())?;
        Ok(Arc::new(client))
    }
}

type HandleCell = Arc<OnceCell<Arc<dyn BlobObjects>>>;

/// Caches peer handles by advertised address. Concurrent resolutions of one
/// address share a cell, so only the first caller constructs the handle.
pub struct ClientPool {
    connector: Arc<dyn PeerConnector>,
    handles: Mutex<HashMap<String, HandleCell>>,
}

impl ClientPool {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, peer: &PeerRecord) -> Result<Arc<dyn BlobObjects>> {
        let cell = {
            let mut handles = self.handles.lock().await;
            handles
                .entry(peer.advertise_addr.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let handle = cell
            .get_or_try_init(|| self.connector.connect(peer))
            .await?;
        Ok(handle.clone())
    }

    /// Drops the cached handle for `addr`. Returns whether one was cached.
    pub async fn evict(&self, addr: &str) -> bool {
        let mut handles = self.handles.lock().await;
        handles.remove(addr).is_some()
    }

    #[cfg(test)]
    async fn cached(&self) -> usize {
        let handles = self.handles.lock().await;
        handles.values().filter(|cell| cell.initialized()).count()
    }
}
