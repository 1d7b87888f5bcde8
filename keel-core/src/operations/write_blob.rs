use crate::cluster::{ClientPool, ClusterConfig, ManifestStore, ObjectLocks, ReplicationMode};
use crate::membership::{PeerRecord, PeerStore};
use crate::storage::{BlobObjects, BlobReader, Envelope};
use crate::{KeelError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Clone)]
pub struct WriteBlobOperation {
    config: ClusterConfig,
    local: Arc<dyn BlobObjects>,
    peers: Arc<PeerStore>,
    pool: Arc<ClientPool>,
    manifests: Arc<ManifestStore>,
    locks: Arc<ObjectLocks>,
}

pub struct WriteBlobOperationRequest {
    pub body: BlobReader,
    pub expected_sha512: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WriteBlobOperationResult {
    pub envelope: Envelope,
    pub holders: BTreeSet<String>,
    pub required_replicas: usize,
    pub committed_replicas: usize,
    pub degraded: bool,
}

impl WriteBlobOperation {
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

    pub async fn run(
        &self,
        request: WriteBlobOperationRequest,
    ) -> Result<WriteBlobOperationResult> {
        let WriteBlobOperationRequest {
            body,
            expected_sha512,
        } = request;

        let required_replicas = self.required_replicas().await?;
        let candidates = if required_replicas > 0 {
            let active = self.peers.active_peers().await;
            if active.len() < required_replicas {
                return Err(KeelError::InsufficientReplicas {
                    required: required_replicas,
                    found: active.len(),
                });
            }
            active
        } else {
            Vec::new()
        };

        let envelope = self
            .local
            .write_blob(body, expected_sha512.as_deref())
            .await?;

        let _guard = self.locks.lock(&envelope.sha512).await;
        // a purge may have removed the bytes before the lock was taken
        if let Err(error) = self.local.blob_envelope(&envelope.sha512).await {
            if error.is_not_found() {
                return Err(KeelError::Unavailable(format!(
                    "object {} was purged while being written, retry the write",
                    envelope.sha512
                )));
            }
            return Err(error);
        }

        // The tombstone of an earlier delete is cleared before any push: once
        // a target accepts the bytes its purge worker can no longer release it.
        let local_only = BTreeSet::from([self.config.peer_id.clone()]);
        let mut manifest = self
            .manifests
            .record_write(&envelope, &local_only, self.config.write_factor)
            .await?;

        let targets = select_targets(candidates, required_replicas, &envelope.sha512);
        let accepted = self.push_to_peers(&envelope, targets).await;
        let committed_replicas = accepted.len();
        if !accepted.is_empty() {
            manifest = self
                .manifests
                .add_holders(&envelope.sha512, &accepted)
                .await?
                .ok_or_else(|| {
                    KeelError::Unavailable(format!(
                        "object {} was purged while being written, retry the write",
                        envelope.sha512
                    ))
                })?;
        }

        let degraded = committed_replicas < required_replicas;
        if degraded {
            tracing::warn!(
                "Write is under-replicated: sha512={} required={} committed={}",
                envelope.sha512,
                required_replicas,
                committed_replicas
            );
            if self.config.replication_mode == ReplicationMode::Strict {
                return Err(KeelError::InsufficientReplicas {
                    required: required_replicas,
                    found: committed_replicas,
                });
            }
        }

        tracing::debug!(
            "Stored object: sha512={} size={} holders={}",
            envelope.sha512,
            envelope.size_bytes,
            manifest.holders.len()
        );

        Ok(WriteBlobOperationResult {
            envelope,
            holders: manifest.holders,
            required_replicas,
            committed_replicas,
            degraded,
        })
    }

    /// Peers that must accept a synchronous push. Write factors of 0, and of
    /// 1 while no other peer has ever announced itself, mean local only.
    async fn required_replicas(&self) -> Result<usize> {
        match self.config.write_factor {
            0 => Ok(0),
            1 if self.peers.known_peer_count().await? == 0 => Ok(0),
            write_factor => Ok(write_factor),
        }
    }

    async fn push_to_peers(
        &self,
        envelope: &Envelope,
        targets: Vec<PeerRecord>,
    ) -> BTreeSet<String> {
        let mut accepted = BTreeSet::new();
        if targets.is_empty() {
            return accepted;
        }

        let mut tasks = JoinSet::new();
        for peer in targets {
            let pool = self.pool.clone();
            let local = self.local.clone();
            let sha512 = envelope.sha512.clone();
            let push_timeout = self.config.push_timeout;

            tasks.spawn(async move {
                let pushed = tokio::time::timeout(push_timeout, async {
                    let handle = pool.resolve(&peer).await?;
                    let body = local.open_blob(&sha512, None).await?;
                    handle.write_blob(body, Some(&sha512)).await
                })
                .await
                .unwrap_or_else(|_| {
                    Err(KeelError::Timeout(format!(
                        "push to {} exceeded {:?}",
                        peer.id, push_timeout
                    )))
                });
                (peer, pushed)
            });
        }

        let deadline = tokio::time::sleep(self.config.write_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    match joined {
                        Ok((peer, Ok(stored))) if stored.sha512 == envelope.sha512 => {
                            accepted.insert(peer.id);
                        }
                        Ok((peer, Ok(stored))) => {
                            tracing::warn!(
                                "Replica push stored wrong content: node={} expected={} actual={}",
                                peer.id,
                                envelope.sha512,
                                stored.sha512
                            );
                        }
                        Ok((peer, Err(error))) => {
                            tracing::warn!(
                                "Replica push failed: node={} sha512={} error={}",
                                peer.id,
                                envelope.sha512,
                                error
                            );
                        }
                        Err(error) => {
                            tracing::warn!("Replica push task failed: error={}", error);
                        }
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        "Replica pushes exceeded write timeout: sha512={} outstanding={}",
                        envelope.sha512,
                        tasks.len()
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        accepted
    }
}

/// Takes `count` peers from `active`, rotated by the first byte of the hash
/// so different objects land on different peers.
fn select_targets(mut active: Vec<PeerRecord>, count: usize, sha512: &str) -> Vec<PeerRecord> {
    if active.is_empty() || count == 0 {
        return Vec::new();
    }

    let offset = sha512
        .get(..2)
        .and_then(|prefix| u8::from_str_radix(prefix, 16).ok())
        .unwrap_or(0) as usize;
    let len = active.len();
    active.rotate_left(offset % len);
    active.truncate(count);
    active
}
