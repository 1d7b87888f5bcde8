use super::liveness::{PeerState, classify, missed_heartbeats};
use crate::clock::Clock;
use crate::cluster::types::ClusterConfig;
use crate::error::Result;
use crate::registry::{
    MetadataBackend, PEER_KEY_PREFIX, RecordUpdate, list_records, peer_key, update_record,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub advertise_addr: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub missed_heartbeats: u32,
    pub state: PeerState,
    pub state_changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Up,
    Down,
    /// Back to `Active` after one or more missed heartbeats, never `Dead`.
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub peer_id: String,
    pub advertise_addr: String,
    pub change: MembershipChange,
}

/// This node's view of cluster membership.
///
/// Peer records live in the metadata backend; every node computes liveness
/// from `last_seen` against its own clock and keeps the result in memory.
/// Transitions into and out of `Dead` are published on a broadcast channel
/// as `Down` and `Up`, and a suspect peer heard from again as `Recovered`.
pub struct PeerStore {
    config: ClusterConfig,
    backend: Arc<dyn MetadataBackend>,
    clock: Arc<dyn Clock>,
    peers: RwLock<HashMap<String, PeerRecord>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl PeerStore {
    pub fn new(
        config: ClusterConfig,
        backend: Arc<dyn MetadataBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            backend,
            clock,
            peers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Upserts this node's record with `last_seen = now`.
    pub async fn announce(&self) -> Result<PeerRecord> {
        let now = self.clock.now();
        let id = self.config.peer_id.clone();
        let advertise_addr = self.config.advertise_addr.clone();

        let record = update_record::<PeerRecord, _>(
            self.backend.as_ref(),
            &peer_key(&id),
            self.config.cas_max_attempts,
            |current| {
                let state_changed_at = match &current {
                    Some(existing) if existing.state == PeerState::Active => {
                        existing.state_changed_at
                    }
                    _ => now,
                };
                Ok(RecordUpdate::Put(PeerRecord {
                    id: id.clone(),
                    advertise_addr: advertise_addr.clone(),
                    last_seen: now,
                    missed_heartbeats: 0,
                    state: PeerState::Active,
                    state_changed_at,
                }))
            },
        )
        .await?;

        Ok(record.unwrap_or(PeerRecord {
            id,
            advertise_addr,
            last_seen: now,
            missed_heartbeats: 0,
            state: PeerState::Active,
            state_changed_at: now,
        }))
    }

    /// Recomputes liveness of every other peer and refreshes the local view.
    ///
    /// A failed listing leaves the view untouched, so a local backend outage
    /// never marks peers dead. Returns the events that were published.
    pub async fn scan(&self) -> Result<Vec<MembershipEvent>> {
        let now = self.clock.now();
        let records = list_records::<PeerRecord>(self.backend.as_ref(), PEER_KEY_PREFIX).await?;

        let mut observed = Vec::with_capacity(records.len());
        for (_, record) in records {
            if record.id == self.config.peer_id {
                continue;
            }
            observed.push(self.refresh_record(record, now).await);
        }

        let mut events = Vec::new();
        let mut peers = self.peers.write().await;
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or(chrono::Duration::MAX);
        let mut seen = Vec::with_capacity(observed.len());

        for record in observed {
            seen.push(record.id.clone());
            let previous = peers.get(&record.id).map(|existing| existing.state);

            match (previous, record.state) {
                (None, PeerState::Dead) => {}
                (None, _) => events.push(event_for(&record, MembershipChange::Up)),
                (Some(PeerState::Dead), PeerState::Active | PeerState::Suspect) => {
                    events.push(event_for(&record, MembershipChange::Up));
                }
                (Some(PeerState::Active | PeerState::Suspect), PeerState::Dead) => {
                    events.push(event_for(&record, MembershipChange::Down));
                }
                (Some(PeerState::Suspect), PeerState::Active) => {
                    events.push(event_for(&record, MembershipChange::Recovered));
                }
                _ => {}
            }

            if record.state == PeerState::Dead
                && now.signed_duration_since(record.state_changed_at) > grace
            {
                if peers.remove(&record.id).is_some() {
                    tracing::info!(
                        "Dropping dead peer from membership view: peer={}",
                        record.id
                    );
                }
                continue;
            }

            peers.insert(record.id.clone(), record);
        }

        peers.retain(|id, _| seen.contains(id));
        drop(peers);

        for event in &events {
            match event.change {
                MembershipChange::Up => tracing::info!(
                    "Peer is up: peer={} addr={}",
                    event.peer_id,
                    event.advertise_addr
                ),
                MembershipChange::Down => tracing::warn!(
                    "Peer is down: peer={} addr={}",
                    event.peer_id,
                    event.advertise_addr
                ),
                MembershipChange::Recovered => tracing::info!(
                    "Peer recovered: peer={} addr={}",
                    event.peer_id,
                    event.advertise_addr
                ),
            }
            // no receivers is not an error
            let _ = self.events.send(event.clone());
        }

        Ok(events)
    }

    /// Writes the recomputed liveness back so that every node's scan
    /// converges on the same durable record. Falls back to the locally
    /// computed value when the write cannot be made.
    async fn refresh_record(&self, record: PeerRecord, now: DateTime<Utc>) -> PeerRecord {
        let period = self.config.heartbeat_period;
        let threshold = self.config.missed_heartbeats;
        let computed = with_liveness(record.clone(), now, period, threshold);
        if computed == record {
            return computed;
        }

        let result = update_record::<PeerRecord, _>(
            self.backend.as_ref(),
            &peer_key(&record.id),
            self.config.cas_max_attempts,
            |current| match current {
                Some(current) => {
                    let updated = with_liveness(current.clone(), now, period, threshold);
                    if updated == current {
                        Ok(RecordUpdate::Keep)
                    } else {
                        Ok(RecordUpdate::Put(updated))
                    }
                }
                None => Ok(RecordUpdate::Keep),
            },
        )
        .await;

        match result {
            Ok(Some(stored)) => stored,
            Ok(None) => computed,
            Err(error) => {
                tracing::warn!(
                    "Failed to record peer liveness: peer={} error={}",
                    record.id,
                    error
                );
                computed
            }
        }
    }

    /// Active peers other than this node, ordered by id.
    pub async fn active_peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut active: Vec<PeerRecord> = peers
            .values()
            .filter(|peer| peer.state == PeerState::Active)
            .cloned()
            .collect();
        active.sort_by(|left, right| left.id.cmp(&right.id));
        active
    }

    pub async fn is_active(&self, peer_id: &str) -> bool {
        let peers = self.peers.read().await;
        peers
            .get(peer_id)
            .is_some_and(|peer| peer.state == PeerState::Active)
    }

    pub async fn peer(&self, peer_id: &str) -> Option<PeerRecord> {
        let peers = self.peers.read().await;
        peers.get(peer_id).cloned()
    }

    /// Every peer in the local view, ordered by id.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut all: Vec<PeerRecord> = peers.values().cloned().collect();
        all.sort_by(|left, right| left.id.cmp(&right.id));
        all
    }

    /// Number of peer records other than this node's in the backend,
    /// regardless of liveness.
    pub async fn known_peer_count(&self) -> Result<usize> {
        let records = self.backend.list(PEER_KEY_PREFIX).await?;
        let own_key = peer_key(&self.config.peer_id);
        Ok(records.iter().filter(|(key, _)| *key != own_key).count())
    }
}

fn with_liveness(
    mut record: PeerRecord,
    now: DateTime<Utc>,
    heartbeat_period: std::time::Duration,
    threshold: u32,
) -> PeerRecord {
    let missed = missed_heartbeats(record.last_seen, now, heartbeat_period);
    let state = classify(missed, threshold);
    if state != record.state {
        record.state_changed_at = now;
    }
    record.missed_heartbeats = missed;
    record.state = state;
    record
}

fn event_for(record: &PeerRecord, change: MembershipChange) -> MembershipEvent {
    MembershipEvent {
        peer_id: record.id.clone(),
        advertise_addr: record.advertise_addr.clone(),
        change,
    }
}
