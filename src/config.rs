//! WolfStore Configuration
//!
//! This module provides configuration structures for a WolfStore node:
//! its identity, the shards it masters and replicates, and where the
//! replicas of its mastered shards live.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::types::{ShardNumber, ShardSet};

/// Main WolfStore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfStoreConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Shard layout and local roles
    pub shards: ShardsConfig,

    /// Replica peers per shard
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,

    /// Transport configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Shard layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardsConfig {
    /// Total number of shards in the cluster
    pub count: u64,

    /// Shards this node masters
    #[serde(default)]
    pub master: Vec<ShardNumber>,

    /// Shards this node replicates
    #[serde(default)]
    pub replica: Vec<ShardNumber>,
}

/// Replica peers of one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub shard: ShardNumber,

    /// Addresses of the nodes replicating the shard
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Size of streamed response chunks in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_chunk_size() -> usize {
    crate::server::DEFAULT_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
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

impl WolfStoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Starter configuration for a node that masters every shard
    ///
    /// The generated text is parsed back before it is returned, so a
    /// rejected layout never reaches disk.
    pub fn template(node_id: &str, shards: u64) -> crate::Result<String> {
        if shards == 0 {
            return Err(crate::Error::Config("shard count must be positive".into()));
        }
        let masters = (0..shards)
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let content = format!(
            r#"# WolfStore Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
# advertise_address = "my-public-ip:7654"

[shards]
count = {shards}
master = [{masters}]
replica = []

# Nodes holding replicas of a mastered shard
# [[replicas]]
# shard = 0
# addresses = ["node-2.example.com:7654"]

[network]
connect_timeout_ms = {connect}
request_timeout_ms = {request}
chunk_size = {chunk_size}

[logging]
level = "info"
format = "pretty"
"#,
            connect = default_connect_timeout_ms(),
            request = default_request_timeout_ms(),
            chunk_size = default_chunk_size(),
        );
        Self::from_str(&content)?;
        Ok(content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.shards.count == 0 {
            return Err(crate::Error::Config("shards.count must be positive".into()));
        }

        if self.network.chunk_size == 0 {
            return Err(crate::Error::Config("network.chunk_size must be positive".into()));
        }

        let configured = self
            .shards
            .master
            .iter()
            .chain(&self.shards.replica)
            .chain(self.replicas.iter().map(|r| &r.shard));
        for shard in configured {
            if *shard >= self.shards.count {
                return Err(crate::Error::Config(format!(
                    "shard {} out of range for {} shards",
                    shard, self.shards.count
                )));
            }
        }

        if let Some(shard) = self.master_shards().intersection(&self.replica_shards()).next() {
            return Err(crate::Error::Config(format!(
                "shard {} cannot be both master and replica",
                shard
            )));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Shards this node masters
    pub fn master_shards(&self) -> ShardSet {
        self.shards.master.iter().copied().collect()
    }

    /// Shards this node replicates
    pub fn replica_shards(&self) -> ShardSet {
        self.shards.replica.iter().copied().collect()
    }

    /// Replica addresses of `shard`, deduplicated
    pub fn replica_addresses(&self, shard: ShardNumber) -> BTreeSet<&str> {
        self.replicas
            .iter()
            .filter(|r| r.shard == shard)
            .flat_map(|r| r.addresses.iter().map(String::as_str))
            .collect()
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.network.request_timeout_ms)
    }
}
