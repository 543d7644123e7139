//! WolfRing Configuration
//!
//! This module provides configuration structures for a WolfRing replica:
//! its identity, the bootstrap cluster, and the tuning knobs of the failure
//! detector, replication engine, data mover and request router.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::membership::NodeId;

/// Main WolfRing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfRingConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Failure detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Replication engine configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Data transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Request router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Replica identity, `host:port` or `host:port#vnode`
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Outbound connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Install a bootstrap view made of this node and its peers at startup
    #[serde(default)]
    pub bootstrap: bool,

    /// Peer replica identities
    #[serde(default)]
    pub peers: Vec<String>,

    /// Minimum number of nodes for quorum (0 = majority of the view)
    #[serde(default)]
    pub min_quorum: usize,
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Detection timeout in milliseconds; heartbeats go out every half of it
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,

    /// Send Ping probes for RTT estimation
    #[serde(default = "default_true")]
    pub probe: bool,

    /// RTO floor in milliseconds
    #[serde(default = "default_min_rto_ms")]
    pub min_rto_ms: u64,

    /// Deviation multiplier in the RTO formula
    #[serde(default = "default_rto_k")]
    pub rto_k: f64,
}

/// Replication engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Prune the log every this many applied positions
    #[serde(default = "default_prune_interval")]
    pub prune_interval: u64,

    /// Number of decided operation ids remembered for duplicate detection
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    /// Items per range-query page
    #[serde(default = "default_page_items")]
    pub page_items: usize,

    /// Bytes per range-query page
    #[serde(default = "default_page_bytes")]
    pub page_bytes: usize,
}

/// Data transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes granted per ClearToSend
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Initial handshake retry interval in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Retry interval growth per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the retry interval in milliseconds
    #[serde(default = "default_max_retry_interval_ms")]
    pub max_retry_interval_ms: u64,

    /// Give up after this many handshake attempts (0 = never)
    #[serde(default)]
    pub max_handshake_attempts: u32,

    /// Offer LZ4-compressed pages
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// Request router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Stats report interval in milliseconds
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Answer a forwarded operation as unavailable after this many milliseconds
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_detection_timeout_ms() -> u64 {
    1000
}

fn default_min_rto_ms() -> u64 {
    50
}

fn default_rto_k() -> f64 {
    4.0
}

fn default_prune_interval() -> u64 {
    1000
}

fn default_dedup_window() -> usize {
    10_000
}

fn default_quota_bytes() -> u64 {
    1024 * 1024
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_interval_ms() -> u64 {
    10_000
}

fn default_page_items() -> usize {
    1000
}

fn default_page_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_stats_interval_ms() -> u64 {
    10_000
}

fn default_forward_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_timeout_ms: default_detection_timeout_ms(),
            probe: true,
            min_rto_ms: default_min_rto_ms(),
            rto_k: default_rto_k(),
        }
    }
}

impl DetectorConfig {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            prune_interval: default_prune_interval(),
            dedup_window: default_dedup_window(),
            page_items: default_page_items(),
            page_bytes: default_page_bytes(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            quota_bytes: default_quota_bytes(),
            retry_interval_ms: default_retry_interval_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_interval_ms: default_max_retry_interval_ms(),
            max_handshake_attempts: 0,
            compression: true,
        }
    }
}

impl TransferConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: default_stats_interval_ms(),
            forward_timeout_ms: default_forward_timeout_ms(),
        }
    }
}

impl RouterConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfRingConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfRingConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfRingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        self.node_id()?;
        self.peer_ids()?;

        if self.detector.detection_timeout_ms < 2 {
            return Err(crate::Error::Config("detector.detection_timeout_ms must be at least 2".into()));
        }

        if self.transfer.quota_bytes == 0 {
            return Err(crate::Error::Config("transfer.quota_bytes must be positive".into()));
        }

        if self.transfer.backoff_multiplier < 1.0 {
            return Err(crate::Error::Config("transfer.backoff_multiplier must be >= 1.0".into()));
        }

        if self.replication.page_items == 0 || self.replication.page_bytes == 0 {
            return Err(crate::Error::Config("replication page limits must be positive".into()));
        }

        if self.router.forward_timeout_ms == 0 {
            return Err(crate::Error::Config("router.forward_timeout_ms must be positive".into()));
        }

        if self.replication.prune_interval == 0 {
            return Err(crate::Error::Config("replication.prune_interval must be positive".into()));
        }

        Ok(())
    }

    /// This replica's identity
    pub fn node_id(&self) -> crate::Result<NodeId> {
        NodeId::parse(&self.node.id)
    }

    /// Identities of the configured peers
    pub fn peer_ids(&self) -> crate::Result<Vec<NodeId>> {
        self.cluster.peers.iter().map(|p| NodeId::parse(p)).collect()
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.node.connect_timeout_ms)
    }

    /// Calculate quorum size
    pub fn quorum_size(&self) -> usize {
        if self.cluster.min_quorum > 0 {
            self.cluster.min_quorum
        } else {
            let total_nodes = self.cluster.peers.len() + 1;
            (total_nodes / 2) + 1
        }
    }

    /// Sample configuration written by `wolfring init`
    pub fn sample(node_id: &str, bind_address: &str) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.to_string(),
                bind_address: bind_address.to_string(),
                connect_timeout_ms: default_connect_timeout_ms(),
            },
            cluster: ClusterConfig {
                bootstrap: true,
                peers: Vec::new(),
                min_quorum: 0,
            },
            detector: DetectorConfig::default(),
            replication: ReplicationConfig::default(),
            transfer: TransferConfig::default(),
            router: RouterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "10.0.0.1:7654"
bind_address = "0.0.0.0:7654"

[cluster]
bootstrap = true
peers = ["10.0.0.2:7654", "10.0.0.3:7654#2"]

[detector]
detection_timeout_ms = 600

[transfer]
quota_bytes = 4096
max_handshake_attempts = 5
"#;

        let config = WolfRingConfig::from_str(toml).unwrap();
        assert_eq!(config.node_id().unwrap(), NodeId::new("10.0.0.1", 7654));
        assert_eq!(config.peer_ids().unwrap()[1], NodeId::with_vnode("10.0.0.3", 7654, 2));
        assert_eq!(config.quorum_size(), 2); // 3 nodes, quorum = 2
        assert_eq!(config.detector.detection_timeout(), Duration::from_millis(600));
        assert!(config.detector.probe);
        assert_eq!(config.transfer.max_handshake_attempts, 5);
        assert_eq!(config.replication.page_items, 1000);
    }

    #[test]
    fn test_invalid_config() {
        let toml = r#"
[node]
id = "not-a-node"
bind_address = "0.0.0.0:7654"
"#;
        assert!(WolfRingConfig::from_str(toml).is_err());

        let toml = r#"
[node]
id = "a:1"
bind_address = "0.0.0.0:7654"

[transfer]
quota_bytes = 0
"#;
        assert!(WolfRingConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_sample_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolfring.toml");

        let sample = WolfRingConfig::sample("127.0.0.1:7654", "0.0.0.0:7654");
        std::fs::write(&path, sample.to_toml().unwrap()).unwrap();

        let loaded = WolfRingConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node.id, "127.0.0.1:7654");
        assert!(loaded.cluster.bootstrap);
        assert_eq!(loaded.transfer.quota_bytes, TransferConfig::default().quota_bytes);
    }
}
