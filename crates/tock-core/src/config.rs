use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TockError};

// Partitioning constants live with the partitioner: changing them re-shards
// every persisted job
pub use tock_shard::{DEFAULT_MAX_QUERY_SIZE, DEFAULT_REPLICAS};

pub const DEFAULT_SCHEDULE_PERIOD_MS: u64 = 1_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 60_000;
pub const DEFAULT_RECOVERY_PERIOD_MS: u64 = 60_000;
pub const DEFAULT_STALE_AFTER_MS: u64 = 300_000;

/// Top-level config (tock.toml + TOCK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TockConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Position of this process inside the fleet.
///
/// Supplied by external coordination; every worker must see the same
/// `fleet_size` at the same moment for the shard assignment to line up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_fleet_size")]
    pub fleet_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            index: 0,
            fleet_size: default_fleet_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence of the registered → queued sweep.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Executions per delivery before the job is declared dead.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff unit between attempts (attempt N waits N × this).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Hard timeout for a single outbound HTTP call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long a rate-limited key stays blocked when the target sends no Retry-After.
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    #[serde(default = "default_max_query_size")]
    pub max_query_size: u32,
    /// Cadence of the sweep that picks up jobs a failed write left behind.
    #[serde(default = "default_recovery_period_ms")]
    pub recovery_period_ms: u64,
    /// A `running` job untouched for this long is resumed by the sweep.
    /// Keep it well above `request_timeout_ms`.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            max_query_size: default_max_query_size(),
            recovery_period_ms: default_recovery_period_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_fleet_size() -> u32 {
    1
}
fn default_period_ms() -> u64 {
    DEFAULT_SCHEDULE_PERIOD_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_rate_limit_backoff_ms() -> u64 {
    DEFAULT_RATE_LIMIT_BACKOFF_MS
}
fn default_max_query_size() -> u32 {
    DEFAULT_MAX_QUERY_SIZE
}
fn default_recovery_period_ms() -> u64 {
    DEFAULT_RECOVERY_PERIOD_MS
}
fn default_stale_after_ms() -> u64 {
    DEFAULT_STALE_AFTER_MS
}
fn default_replicas() -> usize {
    DEFAULT_REPLICAS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tock/tock.db", home)
}

impl TockConfig {
    /// Load config from a TOML file with TOCK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tock/tock.toml
    ///
    /// Env keys use `__` between section and field so that field names keep
    /// their own underscores: `TOCK_WORKER__FLEET_SIZE=4`.
    ///
    /// A missing file is not an error; every field has a default. A file
    /// that fails to parse or describes an impossible fleet is.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        if std::path::Path::new(&path).exists() {
            tracing::debug!(path = %path, "loading config");
        } else {
            tracing::info!(path = %path, "no config file, using defaults and TOCK_* env");
        }

        let config: TockConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TOCK_").split("__"))
            .extract()
            .map_err(|e| TockError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the partitioner cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.worker.fleet_size == 0 {
            return Err(TockError::Config(
                "worker.fleet_size must be at least 1".to_string(),
            ));
        }
        if self.worker.index >= self.worker.fleet_size {
            return Err(TockError::Config(format!(
                "worker.index {} is outside a fleet of {}",
                self.worker.index, self.worker.fleet_size
            )));
        }
        if self.processor.max_attempts == 0 {
            return Err(TockError::Config(
                "processor.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.processor.max_query_size == 0 || self.ring.replicas == 0 {
            return Err(TockError::Config(
                "processor.max_query_size and ring.replicas must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create the directory that will hold the SQLite file.
    pub fn ensure_data_dir(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.database.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tock/tock.toml", home)
}
