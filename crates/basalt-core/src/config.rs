// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration management for Basalt.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for a Basalt node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Local node identity.
    pub node: NodeConfig,
    /// Cluster membership and leadership timing.
    pub cluster: ClusterConfig,
    /// WAL and checkpoint storage configuration.
    pub storage: StorageConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first violated constraint.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id must not be empty".to_string()));
        }
        if self.cluster.renew_low_water_secs >= self.cluster.lease_duration_secs {
            return Err(crate::Error::Config(format!(
                "cluster.renew_low_water_secs ({}) must be below cluster.lease_duration_secs ({})",
                self.cluster.renew_low_water_secs, self.cluster.lease_duration_secs
            )));
        }
        if self.cluster.election_jitter_min_ms > self.cluster.election_jitter_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_jitter_min_ms exceeds cluster.election_jitter_max_ms".to_string(),
            ));
        }
        if self.storage.page_size == 0 || !self.storage.page_size.is_power_of_two() {
            return Err(crate::Error::Config(format!(
                "storage.page_size must be a power of two, got {}",
                self.storage.page_size
            )));
        }
        Ok(())
    }
}

/// Identity of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: String,
    /// Address other members use to reach this node (`host:port`).
    pub address: String,
    /// Address the cluster HTTP listener binds to.
    pub bind: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            address: "127.0.0.1:8080".to_string(),
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A known cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node identifier.
    pub id: String,
    /// Peer address (`host:port`).
    pub address: String,
}

/// Cluster membership and leadership timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Root of the shared network file system holding `_cluster/PRIMARY`,
    /// `_cluster/LEASE` and all branch directories.
    pub root_dir: PathBuf,
    /// Other members of the cluster (the local node is implied).
    pub peers: Vec<PeerConfig>,
    /// How long a lease stays valid after a renewal, in seconds.
    pub lease_duration_secs: u64,
    /// Renew once the remaining lease time drops below this many seconds.
    pub renew_low_water_secs: u64,
    /// Overall election window in milliseconds.
    pub election_timeout_ms: u64,
    /// Timeout for a single vote request in milliseconds.
    pub vote_request_timeout_ms: u64,
    /// Lower bound of the pre-election jitter in milliseconds.
    pub election_jitter_min_ms: u64,
    /// Upper bound of the pre-election jitter in milliseconds.
    pub election_jitter_max_ms: u64,
    /// Interval between heartbeats sent by the primary, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Interval of the leadership monitor loop, in milliseconds.
    pub monitor_interval_ms: u64,
    /// Timeout for other cluster requests (heartbeats, WAL usage), in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data"),
            peers: Vec::new(),
            lease_duration_secs: 30,
            renew_low_water_secs: 10,
            election_timeout_ms: 3_000,
            vote_request_timeout_ms: 3_000,
            election_jitter_min_ms: 100,
            election_jitter_max_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            monitor_interval_ms: 1_000,
            request_timeout_ms: 3_000,
        }
    }
}

impl ClusterConfig {
    /// Lease duration as a [`Duration`].
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Renewal low-water mark as a [`Duration`].
    #[must_use]
    pub fn renew_low_water(&self) -> Duration {
        Duration::from_secs(self.renew_low_water_secs)
    }

    /// Election window as a [`Duration`].
    #[must_use]
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Per-vote timeout as a [`Duration`].
    #[must_use]
    pub fn vote_request_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_request_timeout_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Monitor loop interval as a [`Duration`].
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Generic request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Total number of members including the local node.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.peers.len() + 1
    }
}

/// WAL and checkpoint storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database page size in bytes.
    pub page_size: u32,
    /// Maximum number of entries held by each WAL segment's cache.
    pub wal_cache_capacity: usize,
    /// Minimum time between two fsyncs of a WAL segment, in milliseconds.
    pub wal_sync_interval_ms: u64,
    /// Interval of the periodic checkpoint tick, in milliseconds.
    pub checkpoint_interval_ms: u64,
    /// Interval of the periodic WAL garbage collection, in milliseconds.
    pub gc_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            wal_cache_capacity: 1024,
            wal_sync_interval_ms: 100,
            checkpoint_interval_ms: 1_000,
            gc_interval_ms: 10_000,
        }
    }
}

impl StorageConfig {
    /// WAL sync throttle as a [`Duration`].
    #[must_use]
    pub fn wal_sync_interval(&self) -> Duration {
        Duration::from_millis(self.wal_sync_interval_ms)
    }

    /// Checkpoint tick as a [`Duration`].
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// GC tick as a [`Duration`].
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus endpoint.
    pub enabled: bool,
    /// Port for the metrics endpoint.
    pub port: u16,
    /// Bind address for the metrics endpoint.
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false, port: 9091, bind: "0.0.0.0".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cluster.lease_duration_secs, 30);
        assert_eq!(config.cluster.renew_low_water_secs, 10);
        assert_eq!(config.cluster.election_timeout(), Duration::from_secs(3));
        assert_eq!(config.storage.page_size, 4096);
        assert_eq!(config.storage.wal_sync_interval(), Duration::from_millis(100));
        assert_eq!(config.cluster.member_count(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-2"
address = "10.0.0.2:8080"

[cluster]
root_dir = "/mnt/basalt"
lease_duration_secs = 20
renew_low_water_secs = 5

[[cluster.peers]]
id = "node-1"
address = "10.0.0.1:8080"

[[cluster.peers]]
id = "node-3"
address = "10.0.0.3:8080"

[storage]
page_size = 8192

[logging]
level = "debug"
format = "json"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.node.id, "node-2");
        assert_eq!(config.cluster.root_dir, PathBuf::from("/mnt/basalt"));
        assert_eq!(config.cluster.member_count(), 3);
        assert_eq!(config.cluster.lease_duration(), Duration::from_secs(20));
        assert_eq!(config.storage.page_size, 8192);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_low_water_above_lease() {
        let toml = r#"
[cluster]
lease_duration_secs = 5
renew_low_water_secs = 10
"#;
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("renew_low_water_secs"));
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let toml = r#"
[storage]
page_size = 1000
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("basalt.toml");
        std::fs::write(&path, "[node]\nid = \"from-file\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node.id, "from-file");
    }
}
