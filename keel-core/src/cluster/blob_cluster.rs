use super::endpoint::PeerEndpoint;
use super::locks::ObjectLocks;
use super::manifest::ManifestStore;
use super::pool::{ClientPool, PeerConnector};
use super::types::{ClusterConfig, ReplicationManifest};
use crate::clock::Clock;
use crate::membership::{MembershipChange, MembershipEvent, PeerRecord, PeerStore};
use crate::operations::{
    DeleteBlobOperation, DeleteBlobOperationRequest, DeleteBlobOperationResult,
    FetchObjectsOperation, FetchObjectsOperationResult, ListBlobsOperation, OpenBlobOperation,
    OpenBlobOperationRequest, OpenBlobOperationResult, PurgeObjectsOperation,
    PurgeObjectsOperationResult, WriteBlobOperation, WriteBlobOperationRequest,
    WriteBlobOperationResult,
};
use crate::registry::MetadataBackend;
use crate::storage::{BlobObjects, BlobReader, ByteRange, Envelope, validate_hash};
use crate::{KeelError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// One node's handle on the cluster.
///
/// Wraps the local store with membership, replication manifests and the
/// background duties that keep holders converging. The same object interface
/// the local store exposes is offered here with cluster semantics.
pub struct BlobCluster {
    config: ClusterConfig,
    local: Arc<dyn BlobObjects>,
    peers: Arc<PeerStore>,
    pool: Arc<ClientPool>,
    manifests: Arc<ManifestStore>,
    endpoint: Arc<PeerEndpoint>,
    write_blob_operation: WriteBlobOperation,
    open_blob_operation: OpenBlobOperation,
    delete_blob_operation: DeleteBlobOperation,
    list_blobs_operation: ListBlobsOperation,
    fetch_objects_operation: FetchObjectsOperation,
    purge_objects_operation: PurgeObjectsOperation,
}

impl BlobCluster {
    pub fn new(
        config: ClusterConfig,
        local: Arc<dyn BlobObjects>,
        backend: Arc<dyn MetadataBackend>,
        connector: Arc<dyn PeerConnector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let peers = Arc::new(PeerStore::new(
            config.clone(),
            backend.clone(),
            clock.clone(),
        ));
        let pool = Arc::new(ClientPool::new(connector));
        let manifests = Arc::new(ManifestStore::new(backend, config.cas_max_attempts));
        let locks = Arc::new(ObjectLocks::new());

        let write_blob_operation = WriteBlobOperation::new(
            config.clone(),
            local.clone(),
            peers.clone(),
            pool.clone(),
            manifests.clone(),
            locks.clone(),
        );
        let open_blob_operation = OpenBlobOperation::new(
            config.clone(),
            local.clone(),
            peers.clone(),
            pool.clone(),
            manifests.clone(),
            clock.clone(),
        );
        let delete_blob_operation = DeleteBlobOperation::new(manifests.clone(), clock.clone());
        let list_blobs_operation = ListBlobsOperation::new(manifests.clone());
        let fetch_objects_operation = FetchObjectsOperation::new(
            config.clone(),
            local.clone(),
            peers.clone(),
            pool.clone(),
            manifests.clone(),
            locks.clone(),
        );
        let purge_objects_operation = PurgeObjectsOperation::new(
            config.clone(),
            local.clone(),
            manifests.clone(),
            locks.clone(),
            clock,
        );
        let endpoint = Arc::new(PeerEndpoint::new(
            local.clone(),
            locks,
            delete_blob_operation.clone(),
        ));

        Ok(Self {
            config,
            local,
            peers,
            pool,
            manifests,
            endpoint,
            write_blob_operation,
            open_blob_operation,
            delete_blob_operation,
            list_blobs_operation,
            fetch_objects_operation,
            purge_objects_operation,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<dyn BlobObjects> {
        &self.local
    }

    pub fn peers(&self) -> &Arc<PeerStore> {
        &self.peers
    }

    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    /// The object interface this node offers to its peers.
    pub fn endpoint(&self) -> &Arc<PeerEndpoint> {
        &self.endpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.peers.subscribe()
    }

    pub async fn write(
        &self,
        body: BlobReader,
        expected_sha512: Option<String>,
    ) -> Result<WriteBlobOperationResult> {
        self.write_blob_operation
            .run(WriteBlobOperationRequest {
                body,
                expected_sha512,
            })
            .await
    }

    pub async fn open(
        &self,
        sha512: &str,
        range: Option<ByteRange>,
    ) -> Result<OpenBlobOperationResult> {
        self.open_blob_operation
            .run(OpenBlobOperationRequest {
                sha512: sha512.to_string(),
                range,
            })
            .await
    }

    pub async fn delete(&self, sha512: &str) -> Result<DeleteBlobOperationResult> {
        self.delete_blob_operation
            .run(DeleteBlobOperationRequest {
                sha512: sha512.to_string(),
            })
            .await
    }

    pub async fn manifest(&self, sha512: &str) -> Result<ReplicationManifest> {
        validate_hash(sha512)?;
        self.manifests
            .get(sha512)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("manifest for {}", sha512)))
    }

    /// Publishes this node's liveness once.
    pub async fn heartbeat(&self) -> Result<PeerRecord> {
        self.peers.announce().await
    }

    /// Runs one membership scan and returns the events it published.
    pub async fn scan_peers(&self) -> Result<Vec<MembershipEvent>> {
        self.peers.scan().await
    }

    /// Runs one fetch cycle over every manifest.
    pub async fn fetch_new_objects(&self) -> Result<FetchObjectsOperationResult> {
        self.fetch_objects_operation.run().await
    }

    /// Runs one purge cycle over every tombstoned manifest.
    pub async fn purge_deleted_objects(&self) -> Result<PurgeObjectsOperationResult> {
        self.purge_objects_operation.run().await
    }

    /// Spawns heartbeat, scan, fetch and purge loops plus a task that drops
    /// cached handles of peers going down. Every task exits once `shutdown`
    /// turns true or its sender is dropped.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(5);

        let cluster = self.clone();
        handles.push(spawn_periodic(
            "heartbeat",
            self.config.heartbeat_period,
            shutdown.clone(),
            move || {
                let cluster = cluster.clone();
                async move {
                    if let Err(error) = cluster.heartbeat().await {
                        tracing::warn!("Failed to publish heartbeat: {}", error);
                    }
                }
            },
        ));

        let cluster = self.clone();
        handles.push(spawn_periodic(
            "scan",
            self.config.heartbeat_period,
            shutdown.clone(),
            move || {
                let cluster = cluster.clone();
                async move {
                    if let Err(error) = cluster.scan_peers().await {
                        tracing::warn!("Failed to scan peers: {}", error);
                    }
                }
            },
        ));

        let cluster = self.clone();
        handles.push(spawn_periodic(
            "fetch",
            self.config.fetch_interval,
            shutdown.clone(),
            move || {
                let cluster = cluster.clone();
                async move {
                    match cluster.fetch_new_objects().await {
                        Ok(result) if result.fetched > 0 || !result.errors.is_empty() => {
                            tracing::info!(
                                "Fetch cycle finished: fetched={} skipped={} errors={}",
                                result.fetched,
                                result.skipped,
                                result.errors.len()
                            );
                        }
                        Ok(_) => {}
                        Err(error) => tracing::warn!("Fetch cycle failed: {}", error),
                    }
                }
            },
        ));

        let cluster = self.clone();
        handles.push(spawn_periodic(
            "purge",
            self.config.purge_interval,
            shutdown.clone(),
            move || {
                let cluster = cluster.clone();
                async move {
                    match cluster.purge_deleted_objects().await {
                        Ok(result) if result.purged > 0 || !result.errors.is_empty() => {
                            tracing::info!(
                                "Purge cycle finished: purged={} pending={} \
                                 removed_manifests={} errors={}",
                                result.purged,
                                result.pending,
                                result.removed_manifests,
                                result.errors.len()
                            );
                        }
                        Ok(_) => {}
                        Err(error) => tracing::warn!("Purge cycle failed: {}", error),
                    }
                }
            },
        ));

        handles.push(self.spawn_eviction(shutdown));
        handles
    }

    fn spawn_eviction(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let mut events = self.peers.subscribe();

        tokio::spawn(async move {
            while !*shutdown.borrow() {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) if event.change == MembershipChange::Down => {
                            if pool.evict(&event.advertise_addr).await {
                                tracing::debug!(
                                    "Evicted peer handle: node={} addr={}",
                                    event.peer_id,
                                    event.advertise_addr
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Membership events lagged: skipped={}", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Stopped {} loop", name);
    })
}

#[async_trait]
impl BlobObjects for BlobCluster {
    async fn write_blob(
        &self,
        body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope> {
        let result = self
            .write(body, expected_sha512.map(str::to_string))
            .await?;
        Ok(result.envelope)
    }

    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader> {
        Ok(self.open(sha512, range).await?.reader)
    }

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope> {
        validate_hash(sha512)?;
        match self.manifests.get(sha512).await? {
            Some(manifest) if !manifest.tombstoned => Ok(Envelope {
                sha512: manifest.sha512,
                size_bytes: manifest.size_bytes,
                created_at: manifest.created_at,
            }),
            Some(_) => Err(KeelError::NotFound(format!("object {} was deleted", sha512))),
            None => self.local.blob_envelope(sha512).await,
        }
    }

    async fn delete_blob(&self, sha512: &str) -> Result<()> {
        self.delete(sha512).await?;
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<Envelope>> {
        Ok(self.list_blobs_operation.run().await?.items)
    }
}
