//! Configuration management
//!
//! TOML configuration with per-field defaults, `CASCADE_*` environment
//! variable overrides, and validation.
//!
//! ```toml
//! [engine]
//! conflict_retries = 5
//!
//! [queue]
//! batch_size = 32
//! refresh_interval_ms = 1000
//!
//! [queue.backoff]
//! strategy = "exponential"
//! base_ms = 500
//! max_ms = 300000
//!
//! [cluster]
//! shards = 16
//! owned_shards = [0, 1, 2, 3]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::overrides::ConflictPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Engine behavior
    #[serde(default)]
    pub engine: EngineConfig,

    /// Event queue processing
    #[serde(default)]
    pub queue: QueueConfig,

    /// Shard layout and ownership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Local caches
    #[serde(default)]
    pub cache: CacheConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Attempts per operation when a commit hits an optimistic conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Minimum age of the stored last-queried timestamp before a read
    /// writes it back
    #[serde(default = "default_query_persist_interval_ms")]
    pub query_persist_interval_ms: i64,

    /// Handling of descendants that violate a tightened bound
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

/// Queue processing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Maximum rows fetched per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between polls when the previous batch was not full
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Maximum rows applied concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retry delay strategy for failed applies
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Retry delay strategy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Delay grows geometrically with the failure count
    Exponential {
        /// Delay after the first failure
        #[serde(default = "default_backoff_base_ms")]
        base_ms: u64,
        /// Upper bound on the delay
        #[serde(default = "default_backoff_max_ms")]
        max_ms: u64,
        /// Growth factor per failure
        #[serde(default = "default_backoff_multiplier")]
        multiplier: f64,
        /// Random spread as a fraction of the delay, in `[0, 1]`
        #[serde(default = "default_backoff_jitter")]
        jitter: f64,
    },
    /// Same delay after every failure
    Fixed {
        /// Delay in milliseconds
        #[serde(default = "default_backoff_base_ms")]
        delay_ms: u64,
    },
}

/// Cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Number of shards on the ring
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Virtual nodes per shard
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Shards owned by this node; all shards when absent
    #[serde(default)]
    pub owned_shards: Option<Vec<usize>>,
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum cached counters
    #[serde(default = "default_counter_capacity")]
    pub counter_capacity: usize,

    /// Counter entry TTL in milliseconds
    #[serde(default = "default_counter_ttl_ms")]
    pub counter_ttl_ms: i64,

    /// Maximum cached config lookups
    #[serde(default = "default_config_capacity")]
    pub config_capacity: usize,

    /// Config entry TTL in milliseconds
    #[serde(default = "default_config_ttl_ms")]
    pub config_ttl_ms: i64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_conflict_retries() -> u32 { 5 }
fn default_query_persist_interval_ms() -> i64 { 60_000 }
fn default_batch_size() -> usize { 32 }
fn default_refresh_interval_ms() -> u64 { 1_000 }
fn default_max_concurrency() -> usize { 16 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_backoff_max_ms() -> u64 { 300_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_backoff_jitter() -> f64 { 0.2 }
fn default_shards() -> usize { 16 }
fn default_virtual_nodes() -> usize { 64 }
fn default_counter_capacity() -> usize { 10_000 }
fn default_counter_ttl_ms() -> i64 { 300_000 }
fn default_config_capacity() -> usize { 10_000 }
fn default_config_ttl_ms() -> i64 { 60_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            query_persist_interval_ms: default_query_persist_interval_ms(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            refresh_interval_ms: default_refresh_interval_ms(),
            max_concurrency: default_max_concurrency(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            virtual_nodes: default_virtual_nodes(),
            owned_shards: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            counter_capacity: default_counter_capacity(),
            counter_ttl_ms: default_counter_ttl_ms(),
            config_capacity: default_config_capacity(),
            config_ttl_ms: default_config_ttl_ms(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        },
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| Error::Configuration(format!("{} ({})", e, path.display())))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `CASCADE_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Engine
        if let Some(retries) = env_parse("CASCADE_CONFLICT_RETRIES") {
            self.engine.conflict_retries = retries;
        }
        if let Some(interval) = env_parse("CASCADE_QUERY_PERSIST_INTERVAL_MS") {
            self.engine.query_persist_interval_ms = interval;
        }

        // Queue
        if let Some(size) = env_parse("CASCADE_BATCH_SIZE") {
            self.queue.batch_size = size;
        }
        if let Some(interval) = env_parse("CASCADE_REFRESH_INTERVAL_MS") {
            self.queue.refresh_interval_ms = interval;
        }

        // Cluster
        if let Some(shards) = env_parse("CASCADE_SHARDS") {
            self.cluster.shards = shards;
        }
        if let Ok(owned) = std::env::var("CASCADE_OWNED_SHARDS") {
            let parsed: std::result::Result<Vec<usize>, _> =
                owned.split(',').map(|s| s.trim().parse()).collect();
            match parsed {
                Ok(shards) => self.cluster.owned_shards = Some(shards),
                Err(_) => {
                    tracing::warn!(value = %owned, "Ignoring unparsable CASCADE_OWNED_SHARDS")
                },
            }
        }

        // Cache
        if let Some(capacity) = env_parse("CASCADE_COUNTER_CACHE_CAPACITY") {
            self.cache.counter_capacity = capacity;
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
        if let Ok(log_level) = std::env::var("CASCADE_LOG_LEVEL") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Configuration(msg.to_string()));

        if self.engine.conflict_retries == 0 {
            return invalid("Conflict retries must be > 0");
        }
        if self.engine.query_persist_interval_ms < 0 {
            return invalid("Query persist interval cannot be negative");
        }
        if self.queue.batch_size == 0 {
            return invalid("Queue batch size must be > 0");
        }
        if self.queue.max_concurrency == 0 {
            return invalid("Queue concurrency must be > 0");
        }
        if self.queue.refresh_interval_ms == 0 {
            return invalid("Queue refresh interval must be > 0");
        }
        match &self.queue.backoff {
            BackoffConfig::Exponential {
                base_ms,
                max_ms,
                multiplier,
                jitter,
            } => {
                if *base_ms == 0 || max_ms < base_ms {
                    return invalid("Backoff requires 0 < base_ms <= max_ms");
                }
                if *multiplier < 1.0 {
                    return invalid("Backoff multiplier must be >= 1.0");
                }
                if !(0.0..=1.0).contains(jitter) {
                    return invalid("Backoff jitter must be within [0, 1]");
                }
            },
            BackoffConfig::Fixed { delay_ms } => {
                if *delay_ms == 0 {
                    return invalid("Fixed backoff delay must be > 0");
                }
            },
        }
        if self.cluster.shards == 0 {
            return invalid("Shard count must be > 0");
        }
        if let Some(owned) = &self.cluster.owned_shards {
            if owned.iter().any(|s| *s >= self.cluster.shards) {
                return invalid("Owned shards must be below the shard count");
            }
        }
        if self.cache.counter_capacity == 0 || self.cache.config_capacity == 0 {
            return invalid("Cache capacities must be > 0");
        }
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.batch_size, 32);
        assert!(config.monitoring.metrics_enabled);
        assert_eq!(config.engine.conflict_policy, ConflictPolicy::Cascade);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [queue]
            batch_size = 8

            [queue.backoff]
            strategy = "fixed"
            delay_ms = 250

            [engine]
            conflict_policy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.batch_size, 8);
        assert_eq!(config.queue.refresh_interval_ms, 1_000);
        assert_eq!(config.queue.backoff, BackoffConfig::Fixed { delay_ms: 250 });
        assert_eq!(config.engine.conflict_policy, ConflictPolicy::Reject);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.queue.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.owned_shards = Some(vec![99]);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.backoff = BackoffConfig::Exponential {
            base_ms: 100,
            max_ms: 10,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.toml");
        let mut config = Config::default();
        config.cluster.owned_shards = Some(vec![1, 2]);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.cluster.owned_shards, Some(vec![1, 2]));
        assert_eq!(loaded.queue.backoff, config.queue.backoff);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/cascade.toml").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("CASCADE_OWNED_SHARDS", "3, 4");
        std::env::set_var("CASCADE_BATCH_SIZE", "12");
        let config = Config::from_env();
        assert_eq!(config.cluster.owned_shards, Some(vec![3, 4]));
        assert_eq!(config.queue.batch_size, 12);
        std::env::remove_var("CASCADE_OWNED_SHARDS");
        std::env::remove_var("CASCADE_BATCH_SIZE");
    }
}
