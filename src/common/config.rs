//! Configuration for dpasswd nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`DPASSWD_HTTP_ADDR`, ...)
pub const ENV_PREFIX: &str = "DPASSWD";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier within the cluster)
    #[serde(default)]
    pub node_id: String,

    /// Bind address for the HTTP control plane
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Bind address for Raft peer traffic (also advertised to peers)
    #[serde(default = "default_raft_addr")]
    pub raft_addr: SocketAddr,

    /// Data directory for the embedded store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Start as the sole voter of a new cluster
    #[serde(default)]
    pub bootstrap: bool,

    /// How long writes and membership changes wait for commit
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,

    /// Raft logical clock interval
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Raft election timeout, in ticks
    #[serde(default = "default_election_tick")]
    pub election_tick: usize,

    /// Raft heartbeat interval, in ticks
    #[serde(default = "default_heartbeat_tick")]
    pub heartbeat_tick: usize,

    /// Snapshot threshold (applied entries before log compaction)
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3100))
}
fn default_raft_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4200))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_apply_timeout() -> u64 {
    500
}
fn default_tick_interval() -> u64 {
    100
}
fn default_election_tick() -> usize {
    10
}
fn default_heartbeat_tick() -> usize {
    3
}
fn default_snapshot_threshold() -> u64 {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            http_addr: default_http_addr(),
            raft_addr: default_raft_addr(),
            data_dir: default_data_dir(),
            bootstrap: false,
            apply_timeout_ms: default_apply_timeout(),
            tick_interval_ms: default_tick_interval(),
            election_tick: default_election_tick(),
            heartbeat_tick: default_heartbeat_tick(),
            snapshot_threshold: default_snapshot_threshold(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `DPASSWD_*`
    /// environment variables. Missing fields fall back to defaults.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("node_id is empty".into()));
        }
        if self.apply_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.heartbeat_tick == 0 || self.election_tick <= self.heartbeat_tick {
            return Err(crate::Error::InvalidConfig(format!(
                "election_tick ({}) must be greater than heartbeat_tick ({})",
                self.election_tick, self.heartbeat_tick
            )));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Path of the sled database inside the data directory
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}
