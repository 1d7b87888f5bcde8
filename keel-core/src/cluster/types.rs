use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Writes succeed once stored locally; short replication is reported as
    /// degraded and completed later by fetch workers.
    #[default]
    BestEffort,
    /// Writes fail with `InsufficientReplicas` unless every target accepted
    /// the push. The manifest is still recorded.
    Strict,
}

impl FromStr for ReplicationMode {
    type Err = KeelError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "best-effort" | "besteffort" => Ok(Self::BestEffort),
            "strict" => Ok(Self::Strict),
            other => Err(KeelError::Config(format!(
                "unsupported replication mode: {}",
                other
            ))),
        }
    }
}

/// Per-node cluster configuration, handed to every component at construction.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub peer_id: String,
    pub advertise_addr: String,
    /// Number of peers besides the writer a write pushes to synchronously.
    pub write_factor: usize,
    pub heartbeat_period: Duration,
    /// Missed periods after which a peer is considered dead.
    pub missed_heartbeats: u32,
    pub grace_period: Duration,
    pub fetch_interval: Duration,
    pub purge_interval: Duration,
    pub push_timeout: Duration,
    pub write_timeout: Duration,
    pub cas_max_attempts: usize,
    pub replication_mode: ReplicationMode,
}

impl ClusterConfig {
    pub fn new(peer_id: impl Into<String>, advertise_addr: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            advertise_addr: advertise_addr.into(),
            write_factor: 1,
            heartbeat_period: Duration::from_secs(10),
            missed_heartbeats: 3,
            grace_period: Duration::from_secs(3600),
            fetch_interval: Duration::from_secs(10),
            purge_interval: Duration::from_secs(60),
            push_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(60),
            cas_max_attempts: 16,
            replication_mode: ReplicationMode::BestEffort,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_id.trim().is_empty() {
            return Err(KeelError::Config("peer id cannot be empty".to_string()));
        }
        if self.peer_id.contains('/') {
            return Err(KeelError::Config(format!(
                "peer id '{}' must not contain '/'",
                self.peer_id
            )));
        }
        if self.advertise_addr.trim().is_empty() {
            return Err(KeelError::Config(
                "advertise address cannot be empty".to_string(),
            ));
        }
        if self.heartbeat_period.is_zero() {
            return Err(KeelError::Config(
                "heartbeat period must be positive".to_string(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(KeelError::Config(
                "missed heartbeats threshold must be positive".to_string(),
            ));
        }
        if self.fetch_interval.is_zero() || self.purge_interval.is_zero() {
            return Err(KeelError::Config(
                "fetch and purge intervals must be positive".to_string(),
            ));
        }
        if self.push_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(KeelError::Config("timeouts must be positive".to_string()));
        }
        if self.cas_max_attempts == 0 {
            return Err(KeelError::Config(
                "cas_max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durable per-object replication state, stored under `object/<sha512>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationManifest {
    pub sha512: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub holders: BTreeSet<String>,
    pub write_factor: usize,
    #[serde(default)]
    pub tombstoned: bool,
    #[serde(default)]
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl ReplicationManifest {
    pub fn is_holder(&self, peer_id: &str) -> bool {
        self.holders.contains(peer_id)
    }

    /// True once the tombstone has aged past `grace_period` at `now`.
    pub fn grace_elapsed(&self, now: DateTime<Utc>, grace_period: Duration) -> bool {
        if !self.tombstoned {
            return false;
        }
        let Some(tombstoned_at) = self.tombstoned_at else {
            return true;
        };
        let grace = chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(tombstoned_at) >= grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_degenerate_settings() {
        let valid = ClusterConfig::new("n1", "http://127.0.0.1:19080");
        assert!(valid.validate().is_ok());

        let mut config = valid.clone();
        config.peer_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.heartbeat_period = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.missed_heartbeats = 0;
        assert!(config.validate().is_err());

        let mut config = valid;
        config.cas_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_mode_parse() {
        assert_eq!(
            "best_effort".parse::<ReplicationMode>().unwrap(),
            ReplicationMode::BestEffort
        );
        assert_eq!(
            " Strict ".parse::<ReplicationMode>().unwrap(),
            ReplicationMode::Strict
        );
        assert!("quorum".parse::<ReplicationMode>().is_err());
    }

    #[test]
    fn test_grace_elapsed() {
        let now = Utc::now();
        let mut manifest = ReplicationManifest {
            sha512: "a".repeat(128),
            size_bytes: 1,
            created_at: now,
            holders: BTreeSet::from(["n1".to_string()]),
            write_factor: 1,
            tombstoned: false,
            tombstoned_at: None,
        };
        assert!(!manifest.grace_elapsed(now, Duration::from_secs(60)));

        manifest.tombstoned = true;
        manifest.tombstoned_at = Some(now);
        let grace = Duration::from_secs(60);
        assert!(!manifest.grace_elapsed(now + chrono::Duration::seconds(59), grace));
        assert!(manifest.grace_elapsed(now + chrono::Duration::seconds(60), grace));
    }
}
