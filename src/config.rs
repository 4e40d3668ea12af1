//! Engine configuration
//!
//! One [`StorageConfig`] drives the whole engine: per-tier cache capacity,
//! the sync policy, performance toggles, and durable-store options. A
//! fluent [`StorageConfigBuilder`] mirrors how the rest of the crate builds
//! option structs. Remote credentials are never hard-coded; they come from
//! the environment via [`RemoteConfig::from_env`].

use crate::errors::{Result, StorageError};
use crate::types::SyncPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the remote base URL.
pub const ENV_REMOTE_URL: &str = "TIERSTORE_REMOTE_URL";
/// Environment variable holding the remote API key.
pub const ENV_REMOTE_API_KEY: &str = "TIERSTORE_REMOTE_API_KEY";

/// Eviction strategy for a bounded tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Evict least-recently-used entries first
    Lru,
    /// Evict oldest entries (by write time) first
    Oldest,
}

/// Capacity and lifetime limits for one cache tier.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Maximum total serialized size in bytes
    pub max_size: usize,
    /// Maximum entry count
    pub max_entries: usize,
    /// Eviction strategy once limits are exceeded
    pub strategy: EvictionStrategy,
    /// Optional entry time-to-live
    pub ttl: Option<Duration>,
}

impl TierConfig {
    /// Defaults for the fast volatile tier: small and LRU-evicted.
    pub fn volatile_default() -> Self {
        Self {
            max_size: 8 * 1024 * 1024,
            max_entries: 200,
            strategy: EvictionStrategy::Lru,
            ttl: Some(Duration::from_secs(30 * 60)),
        }
    }

    /// Defaults for the durable tier: larger, oldest-first eviction, no TTL.
    pub fn durable_default() -> Self {
        Self {
            max_size: 256 * 1024 * 1024,
            max_entries: 5000,
            strategy: EvictionStrategy::Oldest,
            ttl: None,
        }
    }
}

/// Cache section: one [`TierConfig`] per local tier.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Volatile (in-memory) tier limits
    pub memory: TierConfig,
    /// Durable (local persistent) tier limits
    pub durable: TierConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: TierConfig::volatile_default(),
            durable: TierConfig::durable_default(),
        }
    }
}

/// Performance section.
#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    /// Emit telemetry events to the configured sink
    pub enable_monitoring: bool,
    /// Interval between logged cache metrics snapshots
    pub monitoring_interval: Duration,
    /// Run periodic cache cleanup/optimization tasks
    pub enable_optimizations: bool,
    /// Serialized size at or above which durable writes carry a
    /// compress-at-rest hint
    pub compression_threshold: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_monitoring: true,
            monitoring_interval: Duration::from_secs(60),
            enable_optimizations: true,
            compression_threshold: 64 * 1024,
        }
    }
}

/// Durable-store section.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Hint: encrypt values at rest
    pub enable_encryption: bool,
    /// Hint: compress values at rest
    pub enable_compression: bool,
    /// Keep a secondary copy of durable data
    pub backup_enabled: bool,
    /// Interval for the periodic cache cleanup task
    pub cleanup_interval: Duration,
    /// Root directory for the durable file store
    pub data_dir: PathBuf,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            enable_encryption: false,
            enable_compression: false,
            backup_enabled: false,
            cleanup_interval: Duration::from_secs(5 * 60),
            data_dir: PathBuf::from(".tierstore"),
        }
    }
}

/// Remote tier endpoint configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the remote API
    pub base_url: String,
    /// Bearer token, if the remote requires one
    pub api_key: Option<String>,
    /// Per-request timeout enforced by the remote adapter
    pub request_timeout: Duration,
}

impl RemoteConfig {
    /// Build a remote config with an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read the remote endpoint from `TIERSTORE_REMOTE_URL` /
    /// `TIERSTORE_REMOTE_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(ENV_REMOTE_URL).map_err(|_| {
            StorageError::Validation(format!("{ENV_REMOTE_URL} is not set"))
        })?;
        let api_key = std::env::var(ENV_REMOTE_API_KEY).ok();
        Ok(Self {
            base_url,
            api_key,
            request_timeout: Duration::from_secs(10),
        })
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Cache tier limits
    pub cache: CacheConfig,
    /// Reconciliation policy
    pub sync: SyncPolicy,
    /// Performance toggles
    pub performance: PerformanceConfig,
    /// Durable-store options
    pub storage: StorageOptions,
}

impl StorageConfig {
    /// Create a builder with default values.
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder::default()
    }
}

/// Fluent builder for [`StorageConfig`].
#[derive(Debug, Default)]
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    /// Set volatile tier limits.
    pub fn memory_tier(mut self, tier: TierConfig) -> Self {
        self.config.cache.memory = tier;
        self
    }

    /// Set durable tier limits.
    pub fn durable_tier(mut self, tier: TierConfig) -> Self {
        self.config.cache.durable = tier;
        self
    }

    /// Cap the volatile tier entry count.
    pub fn memory_max_entries(mut self, max: usize) -> Self {
        self.config.cache.memory.max_entries = max;
        self
    }

    /// Replace the sync policy.
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.config.sync = policy;
        self
    }

    /// Enable or disable auto-sync.
    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.sync.auto_sync = enabled;
        self
    }

    /// Set the batch size for agent-scoped sync.
    pub fn sync_batch_size(mut self, size: usize) -> Self {
        self.config.sync.batch_size = size;
        self
    }

    /// Enable or disable the periodic optimization tasks.
    pub fn optimizations(mut self, enabled: bool) -> Self {
        self.config.performance.enable_optimizations = enabled;
        self
    }

    /// Enable or disable telemetry emission.
    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.config.performance.enable_monitoring = enabled;
        self
    }

    /// Set the periodic cleanup interval.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.storage.cleanup_interval = interval;
        self
    }

    /// Set the durable store root directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.data_dir = dir.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> StorageConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = StorageConfig::builder()
            .memory_max_entries(50)
            .auto_sync(true)
            .sync_batch_size(4)
            .optimizations(false)
            .data_dir("/tmp/tierstore-test")
            .build();

        assert_eq!(config.cache.memory.max_entries, 50);
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync.batch_size, 4);
        assert!(!config.performance.enable_optimizations);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/tierstore-test"));
    }

    #[test]
    fn test_tier_defaults() {
        let volatile = TierConfig::volatile_default();
        let durable = TierConfig::durable_default();
        assert!(volatile.max_entries < durable.max_entries);
        assert_eq!(volatile.strategy, EvictionStrategy::Lru);
        assert_eq!(durable.strategy, EvictionStrategy::Oldest);
        assert!(durable.ttl.is_none());
    }

    #[test]
    fn test_remote_config_from_env_missing() {
        // Only assert the missing-var error path; setting process-wide env
        // vars in tests races with other tests.
        std::env::remove_var(ENV_REMOTE_URL);
        let err = RemoteConfig::from_env().unwrap_err();
        assert!(err.to_string().contains(ENV_REMOTE_URL));
    }
}
