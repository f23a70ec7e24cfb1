//! Configuration parsing and validation.
//!
//! Tessera configuration is loaded from TOML files with CLI overrides.
//! Sections mirror the cache's architectural components: node identity,
//! clustering, locking, transactions, invocation retries and telemetry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and static membership.
    pub node: NodeConfig,

    /// Cache mode and ownership.
    #[serde(default)]
    pub clustering: ClusteringConfig,

    /// Per-key locking.
    #[serde(default)]
    pub locking: LockingConfig,

    /// Transaction support.
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Invocation retry policy.
    #[serde(default)]
    pub invocation: InvocationConfig,

    /// Telemetry and logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Node identity and static membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identifier.
    pub node_id: String,

    /// Initial cluster members, including this node.
    #[serde(default)]
    pub members: Vec<String>,
}

/// How data is spread across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Single node, no clustering.
    Local,
    /// Every member holds every key; writes wait for acknowledgments.
    ReplSync,
    /// Every member holds every key; writes do not wait.
    ReplAsync,
    /// Each node keeps its own data; writes invalidate peers synchronously.
    InvalidationSync,
    /// Each node keeps its own data; writes invalidate peers asynchronously.
    InvalidationAsync,
    /// Keys are owned by `num_owners` members; writes wait for backups.
    DistSync,
    /// Keys are owned by `num_owners` members; writes do not wait.
    DistAsync,
}

impl CacheMode {
    pub fn is_clustered(&self) -> bool {
        !matches!(self, Self::Local)
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Self::ReplSync | Self::ReplAsync)
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::DistSync | Self::DistAsync)
    }

    pub fn is_invalidation(&self) -> bool {
        matches!(self, Self::InvalidationSync | Self::InvalidationAsync)
    }

    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Self::Local | Self::ReplSync | Self::InvalidationSync | Self::DistSync
        )
    }

    /// Whether key ownership is decided by the ownership oracle.
    ///
    /// Local and invalidation caches own everything they hold.
    pub fn uses_oracle(&self) -> bool {
        self.is_replicated() || self.is_distributed()
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::ReplSync => write!(f, "repl-sync"),
            Self::ReplAsync => write!(f, "repl-async"),
            Self::InvalidationSync => write!(f, "invalidation-sync"),
            Self::InvalidationAsync => write!(f, "invalidation-async"),
            Self::DistSync => write!(f, "dist-sync"),
            Self::DistAsync => write!(f, "dist-async"),
        }
    }
}

impl std::str::FromStr for CacheMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "repl-sync" => Ok(Self::ReplSync),
            "repl-async" => Ok(Self::ReplAsync),
            "invalidation-sync" => Ok(Self::InvalidationSync),
            "invalidation-async" => Ok(Self::InvalidationAsync),
            "dist-sync" => Ok(Self::DistSync),
            "dist-async" => Ok(Self::DistAsync),
            other => anyhow::bail!("unknown cache mode: {}", other),
        }
    }
}

/// Clustering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Cache mode.
    #[serde(default = "default_cache_mode")]
    pub cache_mode: CacheMode,

    /// Owners per key in distributed mode.
    #[serde(default = "default_num_owners")]
    pub num_owners: usize,

    /// Timeout for remote calls in milliseconds.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Seed for the reference ownership oracle.
    #[serde(default)]
    pub hash_seed: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            cache_mode: default_cache_mode(),
            num_owners: default_num_owners(),
            remote_timeout_ms: default_remote_timeout_ms(),
            hash_seed: 0,
        }
    }
}

/// Isolation level for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

/// Locking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Maximum wait for a key lock in milliseconds.
    #[serde(default = "default_lock_acquisition_timeout_ms")]
    pub lock_acquisition_timeout_ms: u64,

    /// Initial capacity of the lock table.
    #[serde(default = "default_concurrency_level")]
    pub concurrency_level: usize,

    /// Isolation level.
    #[serde(default = "default_isolation")]
    pub isolation: IsolationLevel,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            lock_acquisition_timeout_ms: default_lock_acquisition_timeout_ms(),
            concurrency_level: default_concurrency_level(),
            isolation: default_isolation(),
        }
    }
}

/// Transaction locking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockingMode {
    Optimistic,
    Pessimistic,
}

/// Transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Whether the cache is transactional.
    #[serde(default)]
    pub enabled: bool,

    /// Locking mode.
    #[serde(default = "default_locking_mode")]
    pub locking_mode: LockingMode,

    /// Validate read versions at prepare time.
    #[serde(default = "default_write_skew_check")]
    pub write_skew_check: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            locking_mode: default_locking_mode(),
            write_skew_check: default_write_skew_check(),
        }
    }
}

/// Invocation retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Restarts allowed after a topology change before giving up.
    #[serde(default = "default_max_topology_retries")]
    pub max_topology_retries: u32,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            max_topology_retries: default_max_topology_retries(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_cache_mode() -> CacheMode {
    CacheMode::DistSync
}

fn default_num_owners() -> usize {
    2
}

fn default_remote_timeout_ms() -> u64 {
    15_000
}

fn default_lock_acquisition_timeout_ms() -> u64 {
    10_000
}

fn default_concurrency_level() -> usize {
    1_000
}

fn default_isolation() -> IsolationLevel {
    IsolationLevel::RepeatableRead
}

fn default_locking_mode() -> LockingMode {
    LockingMode::Optimistic
}

fn default_write_skew_check() -> bool {
    true
}

fn default_max_topology_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Build a configuration for a node in a static cluster.
    pub fn for_node(node_id: impl Into<String>, members: &[&str], cache_mode: CacheMode) -> Self {
        Self {
            node: NodeConfig {
                node_id: node_id.into(),
                members: members.iter().map(|m| m.to_string()).collect(),
            },
            clustering: ClusteringConfig {
                cache_mode,
                ..ClusteringConfig::default()
            },
            locking: LockingConfig::default(),
            transaction: TransactionConfig::default(),
            invocation: InvocationConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref node_id) = overrides.node_id {
            self.node.node_id = node_id.clone();
        }
        if let Some(cache_mode) = overrides.cache_mode {
            self.clustering.cache_mode = cache_mode;
        }
    }

    /// Lock acquisition bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locking.lock_acquisition_timeout_ms)
    }

    /// Remote call bound.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.clustering.remote_timeout_ms)
    }

    /// Whether prepare validates read versions.
    pub fn write_skew_enabled(&self) -> bool {
        self.transaction.enabled && self.transaction.write_skew_check
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_clustering()?;
        self.validate_locking()?;
        self.validate_transaction()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            anyhow::bail!("node.node_id must not be empty");
        }

        if !self.node.members.is_empty() && !self.node.members.contains(&self.node.node_id) {
            anyhow::bail!(
                "node.members must contain node.node_id ({})",
                self.node.node_id
            );
        }

        Ok(())
    }

    fn validate_clustering(&self) -> Result<()> {
        if self.clustering.num_owners == 0 {
            anyhow::bail!("clustering.num_owners must be > 0");
        }

        if self.clustering.remote_timeout_ms == 0 {
            anyhow::bail!("clustering.remote_timeout_ms must be > 0");
        }

        if self.clustering.cache_mode == CacheMode::Local && self.node.members.len() > 1 {
            anyhow::bail!("clustering.cache_mode 'local' cannot have more than one member");
        }

        Ok(())
    }

    fn validate_locking(&self) -> Result<()> {
        if self.locking.lock_acquisition_timeout_ms == 0 {
            anyhow::bail!("locking.lock_acquisition_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_transaction(&self) -> Result<()> {
        if self.write_skew_enabled() && self.locking.isolation != IsolationLevel::RepeatableRead {
            anyhow::bail!("transaction.write_skew_check requires locking.isolation 'repeatable-read'");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override node id.
    pub node_id: Option<String>,
    /// Override cache mode.
    pub cache_mode: Option<CacheMode>,
}
