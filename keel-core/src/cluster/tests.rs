use super::*;
use crate::clock::ManualClock;
use crate::membership::{MembershipChange, PeerRecord};
use crate::operations::BlobSource;
use crate::registry::{MemoryBackend, MetadataBackend, peer_key};
use crate::storage::{
    BlobObjects, BlobReader, ByteRange, Envelope, FsBlobStore, compute_hash, read_all,
    reader_from_bytes,
};
use crate::{KeelError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast, watch};

const HEARTBEAT: Duration = Duration::from_millis(100);
const GRACE: Duration = Duration::from_secs(60);

type Handles = Arc<Mutex<HashMap<String, Arc<dyn BlobObjects>>>>;

/// Hands out the other nodes' peer endpoints directly, standing in for the
/// internal HTTP protocol. Nodes removed from the map are unreachable.
struct MapConnector {
    handles: Handles,
}

#[async_trait]
impl PeerConnector for MapConnector {
    async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn BlobObjects>> {
        let handles = self.handles.lock().unwrap();
        handles
            .get(&peer.id)
            .cloned()
            .ok_or_else(|| KeelError::Unavailable(format!("peer {} is offline", peer.id)))
    }
}

struct PanicConnector;

#[async_trait]
impl PeerConnector for PanicConnector {
    async fn connect(&self, peer: &PeerRecord) -> Result<Arc<dyn BlobObjects>> {
        panic!("a lone node must never contact peers, asked for {}", peer.id);
    }
}

#[derive(Clone, Copy)]
enum Fault {
    /// Never answers within any test timeout.
    Stall,
    /// Serves bytes that do not match the requested hash.
    Corrupt,
}

/// A peer handle that misbehaves in one way and otherwise forwards.
struct FaultyPeer {
    inner: Arc<dyn BlobObjects>,
    fault: Fault,
}

#[async_trait]
impl BlobObjects for FaultyPeer {
    async fn write_blob(
        &self,
        body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope> {
        if let Fault::Stall = self.fault {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.inner.write_blob(body, expected_sha512).await
    }

    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader> {
        match self.fault {
            Fault::Stall => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                self.inner.open_blob(sha512, range).await
            }
            Fault::Corrupt => Ok(reader_from_bytes("not what was asked for")),
        }
    }

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope> {
        self.inner.blob_envelope(sha512).await
    }

    async fn delete_blob(&self, sha512: &str) -> Result<()> {
        self.inner.delete_blob(sha512).await
    }

    async fn list_blobs(&self) -> Result<Vec<Envelope>> {
        self.inner.list_blobs().await
    }
}

/// Local store whose removals block until `release` is notified.
struct GatedDeletes {
    inner: Arc<dyn BlobObjects>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl BlobObjects for GatedDeletes {
    async fn write_blob(
        &self,
        body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope> {
        self.inner.write_blob(body, expected_sha512).await
    }

    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader> {
        self.inner.open_blob(sha512, range).await
    }

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope> {
        self.inner.blob_envelope(sha512).await
    }

    async fn delete_blob(&self, sha512: &str) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.delete_blob(sha512).await
    }

    async fn list_blobs(&self) -> Result<Vec<Envelope>> {
        self.inner.list_blobs().await
    }
}

struct TestCluster {
    backend: Arc<MemoryBackend>,
    clock: ManualClock,
    handles: Handles,
    dirs: Vec<TempDir>,
}

impl TestCluster {
    fn new() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            clock: ManualClock::default(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            dirs: Vec::new(),
        }
    }

    fn config(id: &str, write_factor: usize) -> ClusterConfig {
        let mut config = ClusterConfig::new(id, format!("{}.test:19080", id));
        config.write_factor = write_factor;
        config.heartbeat_period = HEARTBEAT;
        config.missed_heartbeats = 2;
        config.grace_period = GRACE;
        config.fetch_interval = HEARTBEAT;
        config.purge_interval = HEARTBEAT;
        config.push_timeout = Duration::from_secs(5);
        config.write_timeout = Duration::from_secs(5);
        config
    }

    fn store(&mut self) -> Arc<dyn BlobObjects> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlobStore::new(dir.path().to_path_buf()).unwrap());
        self.dirs.push(dir);
        store
    }

    fn connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(MapConnector {
            handles: self.handles.clone(),
        })
    }

    fn add_node(&mut self, config: ClusterConfig) -> Arc<BlobCluster> {
        let store = self.store();
        self.build(config, store, self.connector())
    }

    fn add_node_on(
        &mut self,
        config: ClusterConfig,
        store: Arc<dyn BlobObjects>,
    ) -> Arc<BlobCluster> {
        self.build(config, store, self.connector())
    }

    fn add_node_with(
        &mut self,
        config: ClusterConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<BlobCluster> {
        let store = self.store();
        self.build(config, store, connector)
    }

    fn build(
        &self,
        config: ClusterConfig,
        store: Arc<dyn BlobObjects>,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<BlobCluster> {
        let id = config.peer_id.clone();
        let backend: Arc<dyn MetadataBackend> = self.backend.clone();
        let cluster =
            BlobCluster::new(config, store, backend, connector, Arc::new(self.clock.clone()))
                .unwrap();
        let endpoint: Arc<dyn BlobObjects> = cluster.endpoint().clone();
        self.handles.lock().unwrap().insert(id, endpoint);
        Arc::new(cluster)
    }

    /// Swaps what other nodes reach when they contact `id`.
    fn replace_peer(&self, id: &str, handle: Arc<dyn BlobObjects>) {
        self.handles.lock().unwrap().insert(id.to_string(), handle);
    }

    fn nodes(&mut self, count: usize, write_factor: usize) -> Vec<Arc<BlobCluster>> {
        (1..=count)
            .map(|index| self.add_node(Self::config(&format!("n{}", index), write_factor)))
            .collect()
    }

    fn take_offline(&self, id: &str) {
        self.handles.lock().unwrap().remove(id);
    }
}

async fn converge(nodes: &[Arc<BlobCluster>]) {
    for node in nodes {
        node.heartbeat().await.unwrap();
    }
    for node in nodes {
        node.scan_peers().await.unwrap();
    }
}

async fn read_object(node: &BlobCluster, sha512: &str) -> Vec<u8> {
    let opened = node.open(sha512, None).await.unwrap();
    read_all(opened.reader).await.unwrap().to_vec()
}

fn holders(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn test_single_node_write_read_delete() {
    let mut cluster = TestCluster::new();
    let node = cluster.add_node_with(TestCluster::config("n1", 1), Arc::new(PanicConnector));
    let data = b"lonely bytes".to_vec();

    let written = node.write(reader_from_bytes(data.clone()), None).await.unwrap();
    assert_eq!(written.envelope.sha512, compute_hash(&data));
    assert_eq!(written.required_replicas, 0);
    assert!(!written.degraded);
    assert_eq!(written.holders, holders(&["n1"]));

    let opened = node.open(&written.envelope.sha512, None).await.unwrap();
    assert_eq!(opened.source, BlobSource::Local);
    assert_eq!(read_all(opened.reader).await.unwrap().as_ref(), data.as_slice());
    assert_eq!(node.list_blobs().await.unwrap(), vec![written.envelope.clone()]);

    node.delete(&written.envelope.sha512).await.unwrap();
    assert!(node.list_blobs().await.unwrap().is_empty());
    // still readable inside the grace period
    assert_eq!(read_object(&node, &written.envelope.sha512).await, data);

    cluster.clock.advance(GRACE + Duration::from_secs(1));
    let error = node.open(&written.envelope.sha512, None).await.err().unwrap();
    assert!(error.is_not_found());

    let purged = node.purge_deleted_objects().await.unwrap();
    assert_eq!(purged.purged, 1);
    assert_eq!(purged.removed_manifests, 1);
    assert!(
        node.local()
            .blob_envelope(&written.envelope.sha512)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_replicates_to_write_factor_peers() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 2);
    converge(&nodes).await;

    let data = b"three way".to_vec();
    let written = nodes[0].write(reader_from_bytes(data.clone()), None).await.unwrap();
    assert_eq!(written.required_replicas, 2);
    assert_eq!(written.committed_replicas, 2);
    assert!(!written.degraded);
    assert_eq!(written.holders, holders(&["n1", "n2", "n3"]));

    for node in &nodes {
        let opened = node.open(&written.envelope.sha512, None).await.unwrap();
        assert_eq!(opened.source, BlobSource::Local);
        assert_eq!(read_all(opened.reader).await.unwrap().as_ref(), data.as_slice());
    }
}

#[tokio::test]
async fn test_fetch_completes_replication() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 1);
    converge(&nodes).await;

    let written = nodes[0]
        .write(reader_from_bytes(b"fetch me".to_vec()), None)
        .await
        .unwrap();
    assert_eq!(written.holders.len(), 2);

    let mut fetched = 0;
    for node in &nodes {
        fetched += node.fetch_new_objects().await.unwrap().fetched;
    }
    assert_eq!(fetched, 1);

    let manifest = nodes[0].manifest(&written.envelope.sha512).await.unwrap();
    assert_eq!(manifest.holders, holders(&["n1", "n2", "n3"]));
    for node in &nodes {
        assert!(node.local().blob_envelope(&written.envelope.sha512).await.is_ok());
    }

    // a second cycle has nothing left to do
    for node in &nodes {
        let result = node.fetch_new_objects().await.unwrap();
        assert_eq!(result.fetched, 0);
        assert!(result.errors.is_empty());
    }
}

#[tokio::test]
async fn test_fetch_skips_objects_without_live_holders() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(2, 0);
    converge(&nodes).await;

    let written = nodes[0]
        .write(reader_from_bytes(b"stranded".to_vec()), None)
        .await
        .unwrap();
    assert_eq!(written.holders, holders(&["n1"]));

    cluster.clock.advance(HEARTBEAT * 3);
    nodes[1].heartbeat().await.unwrap();
    nodes[1].scan_peers().await.unwrap();
    assert!(!nodes[1].peers().is_active("n1").await);

    let result = nodes[1].fetch_new_objects().await.unwrap();
    assert_eq!(result.fetched, 0);
    assert_eq!(result.skipped, 1);
}

#[tokio::test]
async fn test_reads_fall_back_to_holders() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(2, 0);
    converge(&nodes).await;

    let data = b"remote read".to_vec();
    let written = nodes[0].write(reader_from_bytes(data.clone()), None).await.unwrap();

    let opened = nodes[1].open(&written.envelope.sha512, None).await.unwrap();
    assert_eq!(opened.source, BlobSource::Peer("n1".to_string()));
    assert_eq!(read_all(opened.reader).await.unwrap().as_ref(), data.as_slice());

    cluster.take_offline("n1");
    cluster.clock.advance(HEARTBEAT * 3);
    nodes[1].heartbeat().await.unwrap();
    nodes[1].scan_peers().await.unwrap();
    let error = nodes[1].open(&written.envelope.sha512, None).await.err().unwrap();
    assert!(matches!(error, KeelError::Unavailable(_)));
}

#[tokio::test]
async fn test_open_rejects_unknown_and_malformed_hashes() {
    let mut cluster = TestCluster::new();
    let node = cluster.add_node(TestCluster::config("n1", 1));

    let unknown = compute_hash(b"never written");
    assert!(node.open(&unknown, None).await.err().unwrap().is_not_found());

    let error = node.open("not-a-hash", None).await.err().unwrap();
    assert!(matches!(error, KeelError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_deleted_objects_are_cleaned_up_after_grace() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 2);
    converge(&nodes).await;

    let written = nodes[0]
        .write(reader_from_bytes(b"short lived".to_vec()), None)
        .await
        .unwrap();
    let sha512 = written.envelope.sha512.clone();
    for node in &nodes {
        node.fetch_new_objects().await.unwrap();
    }

    nodes[1].delete(&sha512).await.unwrap();
    for node in &nodes {
        let result = node.purge_deleted_objects().await.unwrap();
        assert_eq!(result.pending, 1);
        assert_eq!(result.purged, 0);
        assert!(node.local().blob_envelope(&sha512).await.is_ok());
    }

    cluster.clock.advance(GRACE + Duration::from_secs(60));
    let mut removed_manifests = 0;
    for node in &nodes {
        let result = node.purge_deleted_objects().await.unwrap();
        assert_eq!(result.purged, 1);
        assert!(result.errors.is_empty());
        removed_manifests += result.removed_manifests;
    }
    assert_eq!(removed_manifests, 1);
    assert!(nodes[0].manifests().get(&sha512).await.unwrap().is_none());

    for node in &nodes {
        assert!(node.open(&sha512, None).await.err().unwrap().is_not_found());
        assert!(node.local().blob_envelope(&sha512).await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn test_writing_twice_is_idempotent() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 2);
    converge(&nodes).await;

    let data = b"same content".to_vec();
    let first = nodes[0].write(reader_from_bytes(data.clone()), None).await.unwrap();
    let second = nodes[0].write(reader_from_bytes(data), None).await.unwrap();

    assert_eq!(first.envelope.sha512, second.envelope.sha512);
    assert_eq!(first.envelope.size_bytes, second.envelope.size_bytes);
    assert_eq!(first.holders, second.holders);
    assert_eq!(nodes[0].list_blobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rewrite_clears_tombstone() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(1, 1);

    let data = b"come back".to_vec();
    let written = nodes[0].write(reader_from_bytes(data.clone()), None).await.unwrap();
    nodes[0].delete(&written.envelope.sha512).await.unwrap();
    nodes[0].write(reader_from_bytes(data), None).await.unwrap();

    let manifest = nodes[0].manifest(&written.envelope.sha512).await.unwrap();
    assert!(!manifest.tombstoned);
    assert!(manifest.tombstoned_at.is_none());

    cluster.clock.advance(GRACE * 2);
    let result = nodes[0].purge_deleted_objects().await.unwrap();
    assert_eq!(result.purged, 0);
    assert!(nodes[0].local().blob_envelope(&written.envelope.sha512).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_writes_union_holders() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(2, 0);
    converge(&nodes).await;

    let data = b"written everywhere".to_vec();
    let (left, right) = tokio::join!(
        nodes[0].write(reader_from_bytes(data.clone()), None),
        nodes[1].write(reader_from_bytes(data.clone()), None),
    );
    let sha512 = left.unwrap().envelope.sha512;
    assert_eq!(right.unwrap().envelope.sha512, sha512);

    let manifest = nodes[0].manifest(&sha512).await.unwrap();
    assert_eq!(manifest.holders, holders(&["n1", "n2"]));
}

#[tokio::test]
async fn test_heartbeat_loss_and_recovery_emit_events() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(2, 1);
    converge(&nodes).await;

    let mut events = nodes[0].subscribe();

    cluster.clock.advance(HEARTBEAT * 2 + Duration::from_millis(50));
    nodes[0].heartbeat().await.unwrap();
    nodes[0].scan_peers().await.unwrap();
    nodes[0].scan_peers().await.unwrap();

    nodes[1].heartbeat().await.unwrap();
    nodes[0].scan_peers().await.unwrap();
    nodes[0].scan_peers().await.unwrap();

    let down = events.try_recv().unwrap();
    assert_eq!(down.peer_id, "n2");
    assert_eq!(down.change, MembershipChange::Down);
    let up = events.try_recv().unwrap();
    assert_eq!(up.peer_id, "n2");
    assert_eq!(up.change, MembershipChange::Up);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_dead_peers_are_not_write_targets() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 2);
    converge(&nodes).await;

    cluster.clock.advance(HEARTBEAT * 3);
    nodes[0].heartbeat().await.unwrap();
    nodes[1].heartbeat().await.unwrap();
    nodes[0].scan_peers().await.unwrap();

    let data = b"needs two peers".to_vec();
    let error = nodes[0]
        .write(reader_from_bytes(data.clone()), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        error,
        KeelError::InsufficientReplicas {
            required: 2,
            found: 1
        }
    ));
    // rejected before anything was stored
    assert!(nodes[0].local().list_blobs().await.unwrap().is_empty());
    assert!(nodes[0].manifests().get(&compute_hash(&data)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_push_modes() {
    let mut cluster = TestCluster::new();
    let best_effort = cluster.add_node(TestCluster::config("n1", 1));
    let mut strict_config = TestCluster::config("n2", 1);
    strict_config.replication_mode = ReplicationMode::Strict;
    let strict = cluster.add_node(strict_config);
    let nodes = vec![best_effort.clone(), strict.clone()];
    converge(&nodes).await;

    cluster.take_offline("n2");
    let written = best_effort
        .write(reader_from_bytes(b"best effort".to_vec()), None)
        .await
        .unwrap();
    assert!(written.degraded);
    assert_eq!(written.committed_replicas, 0);
    assert_eq!(written.holders, holders(&["n1"]));

    cluster.take_offline("n1");
    let data = b"strict".to_vec();
    let error = strict
        .write(reader_from_bytes(data.clone()), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        error,
        KeelError::InsufficientReplicas {
            required: 1,
            found: 0
        }
    ));
    let manifest = strict.manifest(&compute_hash(&data)).await.unwrap();
    assert_eq!(manifest.holders, holders(&["n2"]));
}

#[tokio::test]
async fn test_write_rejects_unexpected_hash() {
    let mut cluster = TestCluster::new();
    let node = cluster.add_node(TestCluster::config("n1", 0));

    let error = node
        .write(
            reader_from_bytes(b"payload".to_vec()),
            Some(compute_hash(b"other payload")),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(error, KeelError::HashMismatch { .. }));
    assert!(node.list_blobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_runs_duties_until_shutdown() {
    let mut cluster = TestCluster::new();
    let node = cluster.add_node(TestCluster::config("n1", 1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = node.start(shutdown_rx);
    assert_eq!(handles.len(), 5);

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert!(cluster.backend.get(&peer_key("n1")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_purge_racing_a_rewrite_keeps_the_pushed_copy() {
    let mut cluster = TestCluster::new();
    let writer = cluster.add_node(TestCluster::config("n1", 1));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = Arc::new(GatedDeletes {
        inner: cluster.store(),
        entered: entered.clone(),
        release: release.clone(),
    });
    let holder = cluster.add_node_on(TestCluster::config("n2", 1), gated);
    let nodes = vec![writer.clone(), holder.clone()];
    converge(&nodes).await;

    let data = b"deleted then written again".to_vec();
    let written = writer.write(reader_from_bytes(data.clone()), None).await.unwrap();
    assert_eq!(written.holders, holders(&["n1", "n2"]));
    let sha512 = written.envelope.sha512.clone();
    writer.delete(&sha512).await.unwrap();
    cluster.clock.advance(GRACE + Duration::from_secs(1));
    converge(&nodes).await;

    // the holder has released itself and is about to remove its bytes
    let purge = {
        let holder = holder.clone();
        tokio::spawn(async move { holder.purge_deleted_objects().await })
    };
    entered.notified().await;

    let rewrite = {
        let writer = writer.clone();
        let data = data.clone();
        tokio::spawn(async move { writer.write(reader_from_bytes(data), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!rewrite.is_finished());

    release.notify_one();
    let purged = purge.await.unwrap().unwrap();
    assert_eq!(purged.purged, 1);
    let rewritten = rewrite.await.unwrap().unwrap();
    assert_eq!(rewritten.committed_replicas, 1);
    assert_eq!(rewritten.holders, holders(&["n1", "n2"]));

    let manifest = writer.manifest(&sha512).await.unwrap();
    assert!(!manifest.tombstoned);
    assert!(manifest.is_holder("n2"));
    assert!(holder.local().blob_envelope(&sha512).await.is_ok());

    // nothing left for a later purge to remove
    let again = holder.purge_deleted_objects().await.unwrap();
    assert_eq!(again.purged, 0);
    assert_eq!(read_object(&holder, &sha512).await, data);
}

#[tokio::test]
async fn test_ranged_reads_locally_and_from_holders() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(2, 0);
    converge(&nodes).await;

    let written = nodes[0]
        .write(reader_from_bytes("0123456789"), None)
        .await
        .unwrap();
    let sha512 = written.envelope.sha512.clone();

    let local = nodes[0]
        .open(&sha512, Some(ByteRange::new(2, 5)))
        .await
        .unwrap();
    assert_eq!(local.source, BlobSource::Local);
    assert_eq!(local.size_bytes, 10);
    assert_eq!(local.range, Some(ByteRange::new(2, 5)));
    assert_eq!(read_all(local.reader).await.unwrap().as_ref(), b"2345");

    let remote = nodes[1]
        .open(&sha512, Some(ByteRange::new(7, 20)))
        .await
        .unwrap();
    assert_eq!(remote.source, BlobSource::Peer("n1".to_string()));
    assert_eq!(remote.size_bytes, 10);
    assert_eq!(remote.range, Some(ByteRange::new(7, 9)));
    assert_eq!(read_all(remote.reader).await.unwrap().as_ref(), b"789");

    for node in &nodes {
        let error = node
            .open(&sha512, Some(ByteRange::new(10, 12)))
            .await
            .err()
            .unwrap();
        assert!(matches!(error, KeelError::InvalidRange(_)));
    }
}

#[tokio::test]
async fn test_stalled_peer_is_bounded_by_push_and_write_timeouts() {
    let timeouts = [
        (Duration::from_millis(100), Duration::from_secs(5)),
        (Duration::from_secs(5), Duration::from_millis(100)),
    ];

    for (push_timeout, write_timeout) in timeouts {
        let mut cluster = TestCluster::new();
        let mut config = TestCluster::config("n1", 1);
        config.push_timeout = push_timeout;
        config.write_timeout = write_timeout;
        let writer = cluster.add_node(config);
        let slow = cluster.add_node(TestCluster::config("n2", 1));
        converge(&[writer.clone(), slow.clone()]).await;
        cluster.replace_peer(
            "n2",
            Arc::new(FaultyPeer {
                inner: slow.endpoint().clone(),
                fault: Fault::Stall,
            }),
        );

        let started = Instant::now();
        let written = writer
            .write(reader_from_bytes(b"slow peer".to_vec()), None)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(written.degraded);
        assert_eq!(written.required_replicas, 1);
        assert_eq!(written.committed_replicas, 0);
        assert_eq!(written.holders, holders(&["n1"]));
    }
}

#[tokio::test]
async fn test_fetch_discards_corrupt_copies_and_moves_on() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 0);
    converge(&nodes).await;

    let data = b"checked on arrival".to_vec();
    let written = nodes[0].write(reader_from_bytes(data.clone()), None).await.unwrap();
    let sha512 = written.envelope.sha512.clone();
    cluster.replace_peer(
        "n1",
        Arc::new(FaultyPeer {
            inner: nodes[0].endpoint().clone(),
            fault: Fault::Corrupt,
        }),
    );

    let result = nodes[2].fetch_new_objects().await.unwrap();
    assert_eq!(result.fetched, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(nodes[2].local().blob_envelope(&sha512).await.unwrap_err().is_not_found());
    assert!(!nodes[2].manifest(&sha512).await.unwrap().is_holder("n3"));

    // a healthy second holder serves the copy the first one could not
    nodes[1].write(reader_from_bytes(data.clone()), None).await.unwrap();
    let result = nodes[2].fetch_new_objects().await.unwrap();
    assert_eq!(result.fetched, 1);
    assert!(result.errors.is_empty());
    let opened = nodes[2].open(&sha512, None).await.unwrap();
    assert_eq!(opened.source, BlobSource::Local);
    assert_eq!(read_all(opened.reader).await.unwrap().as_ref(), data.as_slice());
    assert_eq!(
        nodes[2].manifest(&sha512).await.unwrap().holders,
        holders(&["n1", "n2", "n3"])
    );
}

#[tokio::test]
async fn test_fetch_from_a_holder_without_bytes_records_nothing() {
    let mut cluster = TestCluster::new();
    let nodes = cluster.nodes(3, 0);
    converge(&nodes).await;

    let written = nodes[0]
        .write(reader_from_bytes(b"lost on disk".to_vec()), None)
        .await
        .unwrap();
    let sha512 = written.envelope.sha512.clone();
    nodes[0].local().delete_blob(&sha512).await.unwrap();

    let result = nodes[2].fetch_new_objects().await.unwrap();
    assert_eq!(result.fetched, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(nodes[2].local().blob_envelope(&sha512).await.unwrap_err().is_not_found());
    assert_eq!(
        nodes[2].manifest(&sha512).await.unwrap().holders,
        holders(&["n1"])
    );
}
