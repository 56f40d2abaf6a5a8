//! Configuration types for the search synchronizer
//!
//! Uses the `config` crate for layered configuration from files and environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::strategy::LogMode;

/// Root configuration for the daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Source database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Where target configuration lives
    #[serde(default)]
    pub config_store: ConfigStoreConfig,

    /// Per-engine behavior
    #[serde(default)]
    pub engine: EngineConfig,

    /// Reconciliation loop and cleanup sweep
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Search index HTTP client
    #[serde(default)]
    pub index: IndexConfig,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminApiConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Database Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string of the source deployment
    #[serde(default = "default_database_uri")]
    pub uri: String,

    /// Force a log collection instead of auto-detecting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_mode: Option<LogMode>,

    /// Server-side wait for new log entries on a tailing cursor
    #[serde(with = "humantime_serde", default = "default_await_time")]
    pub tail_await: Duration,

    /// Most log entries returned by one drain of a tailing cursor
    #[serde(default = "default_tail_batch_size")]
    pub tail_batch_size: usize,
}

fn default_database_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_await_time() -> Duration {
    Duration::from_millis(200)
}

fn default_tail_batch_size() -> usize {
    1000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: default_database_uri(),
            log_mode: None,
            tail_await: default_await_time(),
            tail_batch_size: default_tail_batch_size(),
        }
    }
}

/// Configuration store backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStoreKind {
    Mongo,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigStoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: ConfigStoreKind,

    /// Database holding the config collection (mongo)
    #[serde(default = "default_store_database")]
    pub database: String,

    /// Config collection (mongo)
    #[serde(default = "default_store_collection")]
    pub collection: String,

    /// JSON file of records (file)
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_kind() -> ConfigStoreKind {
    ConfigStoreKind::Mongo
}

fn default_store_database() -> String {
    "search_sync".to_string()
}

fn default_store_collection() -> String {
    "config".to_string()
}

fn default_store_path() -> String {
    "/var/lib/search-sync/targets.json".to_string()
}

impl Default for ConfigStoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            database: default_store_database(),
            collection: default_store_collection(),
            path: default_store_path(),
        }
    }
}

// ============================================================================
// Component Configurations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sleep between tailing iterations
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Wait between retries of a failed index call
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,

    /// Wait before reconnecting to the database or retrying a batch
    #[serde(with = "humantime_serde", default = "default_error_interval")]
    pub error_interval: Duration,

    /// Re-bulk-load after a stale cursor or rollback instead of failing
    #[serde(default)]
    pub auto_reconcile: bool,

    /// Documents per `add` call during bulk load
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_error_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_bulk_batch_size() -> usize {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            retry_interval: default_retry_interval(),
            error_interval: default_error_interval(),
            auto_reconcile: false,
            bulk_batch_size: default_bulk_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How often the configuration store is re-read
    #[serde(with = "humantime_serde", default = "default_config_poll_interval")]
    pub config_poll_interval: Duration,

    /// How often tombstones are purged
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    /// Minimum age of a tombstone before it is purged
    #[serde(with = "humantime_serde", default = "default_cleanup_age")]
    pub cleanup_age: Duration,

    /// Tombstones removed per index query
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,
}

fn default_config_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_cleanup_age() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cleanup_batch_size() -> usize {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_poll_interval: default_config_poll_interval(),
            cleanup_interval: default_cleanup_interval(),
            cleanup_age: default_cleanup_age(),
            cleanup_batch_size: default_cleanup_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApiConfig {
    /// Enable admin API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

fn default_true() -> bool {
    true
}

fn default_admin_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for AdminApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl SyncConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix SEARCH_SYNC_
        builder = builder.add_source(
            config::Environment::with_prefix("SEARCH_SYNC")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let config = SyncConfig::load(None).unwrap();
        assert_eq!(config.engine.poll_interval, Duration::from_secs(1));
        assert_eq!(config.config_store.kind, ConfigStoreKind::Mongo);
        assert!(!config.engine.auto_reconcile);
        assert_eq!(config.database.log_mode, None);
    }

    #[test]
    fn test_humantime_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"poll_interval": "250ms", "auto_reconcile": true}"#).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert!(config.auto_reconcile);
    }
}
