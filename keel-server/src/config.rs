use keel_core::{BackendBuilder, ClusterConfig, KeelError, ReplicationMode, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub peer_auth: PeerAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: String,
    pub bind_addr: String,
    /// Address other peers dial; defaults to `bind_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    /// Defaults to `<data_dir>/meta.db`. Nodes sharing one host may point
    /// at the same file.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            sqlite_path: None,
        }
    }
}

fn default_backend_kind() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_write_factor")]
    pub write_factor: usize,
    #[serde(default)]
    pub mode: ReplicationMode,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            write_factor: default_write_factor(),
            mode: ReplicationMode::default(),
            push_timeout_ms: default_push_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            cas_max_attempts: default_cas_max_attempts(),
        }
    }
}

fn default_write_factor() -> usize {
    1
}

fn default_push_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    60_000
}

fn default_cas_max_attempts() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period_ms(),
            missed_heartbeats: default_missed_heartbeats(),
        }
    }
}

fn default_heartbeat_period_ms() -> u64 {
    10_000
}

fn default_missed_heartbeats() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_gc_interval_ms")]
    pub interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            interval_ms: default_gc_interval_ms(),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    3_600
}

fn default_gc_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_interval_ms")]
    pub interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_fetch_interval_ms(),
        }
    }
}

fn default_fetch_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerAuthConfig {
    #[serde(default)]
    pub token: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("KEEL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| KeelError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| KeelError::Config(e.to_string()))?;

        Ok(config)
    }

    #[cfg(test)]
    fn from_yaml(content: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(
                content,
                ::config::FileFormat::Yaml,
            ))
            .build()
            .map_err(|e| KeelError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| KeelError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(KeelError::Config(
                "node.id is required (or pass --node)".to_string(),
            ));
        }
        if self.node.bind_addr.trim().is_empty() {
            return Err(KeelError::Config("node.bind_addr cannot be empty".to_string()));
        }
        if self.peer_auth.token.trim().is_empty() {
            return Err(KeelError::Config(
                "peer_auth.token cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn advertise_addr(&self) -> &str {
        self.node
            .advertise_addr
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.node.bind_addr)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.node.data_dir.join("blobs")
    }

    pub fn to_cluster_config(&self) -> Result<ClusterConfig> {
        self.validate()?;

        let mut cluster = ClusterConfig::new(self.node.id.clone(), self.advertise_addr());
        cluster.write_factor = self.replication.write_factor;
        cluster.replication_mode = self.replication.mode;
        cluster.push_timeout = Duration::from_millis(self.replication.push_timeout_ms);
        cluster.write_timeout = Duration::from_millis(self.replication.write_timeout_ms);
        cluster.cas_max_attempts = self.replication.cas_max_attempts;
        cluster.heartbeat_period = Duration::from_millis(self.membership.heartbeat_period_ms);
        cluster.missed_heartbeats = self.membership.missed_heartbeats;
        cluster.grace_period = Duration::from_secs(self.gc.grace_period_secs);
        cluster.purge_interval = Duration::from_millis(self.gc.interval_ms);
        cluster.fetch_interval = Duration::from_millis(self.fetch.interval_ms);

        cluster.validate()?;
        Ok(cluster)
    }

    pub fn backend_builder(&self) -> BackendBuilder {
        let sqlite_path = self
            .backend
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("meta.db"));

        BackendBuilder::new()
            .kind(self.backend.kind.clone())
            .sqlite_path(sqlite_path)
    }
}
