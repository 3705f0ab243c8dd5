use std::time::Duration;

use log::warn;
use serde_derive::Deserialize;

use crate::raft::node::NodeOptions;
use crate::raft::Member;
use crate::service::Timeouts;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub commit_ms: u64,
    pub total_ms: u64,
    /// Bound on every cache or database call.
    pub tier_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            commit_ms: 10_000,
            total_ms: 30_000,
            tier_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    pub tick_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub snapshot_interval_secs: u64,
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            tick_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_interval_secs: 20,
            snapshot_threshold: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// MySQL URL of the durable store; in-memory when absent.
    pub database_url: Option<String>,
    /// Redis URL of the cache; in-memory when absent.
    pub redis_url: Option<String>,
    pub cache_ttl_secs: u64,
    pub preload_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_url: None,
            redis_url: None,
            cache_ttl_secs: 24 * 60 * 60,
            preload_limit: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `name:host:port`, host and port being this node's HTTP address as
    /// clients reach it.
    pub node_id: String,
    pub raft_addr: String,
    pub http_addr: String,
    pub metrics_addr: String,
    pub bootstrap: bool,
    /// HTTP address of a running member to ask for admission.
    pub join_addr: Option<String>,
    pub registry_shards: usize,
    pub timeouts: TimeoutConfig,
    pub raft: RaftConfig,
    pub storage: StorageConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            node_id: "node1:127.0.0.1:7070".to_string(),
            raft_addr: "127.0.0.1:7000".to_string(),
            http_addr: "0.0.0.0:7070".to_string(),
            metrics_addr: "0.0.0.0:7080".to_string(),
            bootstrap: true,
            join_addr: None,
            registry_shards: 16,
            timeouts: TimeoutConfig::default(),
            raft: RaftConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Loads the config at `path`, falling back to defaults if it is missing or malformed.
    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return RuntimeConfig::new();
            }
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Self {
        match toml::from_str(contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::new()
            }
        }
    }

    pub fn member(&self) -> Member {
        Member::voter(self.node_id.clone(), self.raft_addr.clone())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            commit: Duration::from_millis(self.timeouts.commit_ms),
            total: Duration::from_millis(self.timeouts.total_ms),
        }
    }

    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.tier_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.cache_ttl_secs)
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            member: self.member(),
            bootstrap: self.bootstrap,
            tick: Duration::from_millis(self.raft.tick_ms),
            election_tick: self.raft.election_tick,
            heartbeat_tick: self.raft.heartbeat_tick,
            snapshot_interval: Duration::from_secs(self.raft.snapshot_interval_secs),
            snapshot_threshold: self.raft.snapshot_threshold,
            membership_timeout: Duration::from_millis(self.timeouts.commit_ms),
        }
    }
}
