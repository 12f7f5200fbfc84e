use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::maintenance::{ReconcileSettings, RetentionSettings};
use crate::worker::{ExecutorSettings, TimeLimits};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            store: StoreConfig::default(),
            broker: BrokerConfig::default(),
            documents: DocumentsConfig::default(),
            workers: WorkersConfig::default(),
            retention: RetentionConfig::default(),
            reconcile: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_connection")]
    pub connection: String,
}

fn default_connection() -> String {
    crate::db::default_database_path()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "docqueue.db".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: default_connection(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Separate queue database. `None` shares the store database.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_lease_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_directory")]
    pub directory: String,
}

fn default_documents_directory() -> String {
    dirs::home_dir()
        .map(|h| h.join(".docqueue").join("documents"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "documents".to_string())
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            directory: default_documents_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_soft_limit")]
    pub soft_time_limit_secs: u64,
    #[serde(default = "default_hard_limit")]
    pub hard_time_limit_secs: u64,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

fn default_worker_count() -> usize {
    2
}

fn default_soft_limit() -> u64 {
    25 * 60
}

fn default_hard_limit() -> u64 {
    30 * 60
}

fn default_max_deliveries() -> u32 {
    3
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            soft_time_limit_secs: default_soft_limit(),
            hard_time_limit_secs: default_hard_limit(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl WorkersConfig {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            limits: TimeLimits::new(
                Duration::from_secs(self.soft_time_limit_secs),
                Duration::from_secs(self.hard_time_limit_secs),
            ),
            max_deliveries: self.max_deliveries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_window")]
    pub window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u64,
}

fn default_retention_window() -> u64 {
    30 * 24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

fn default_sweep_batch() -> u64 {
    500
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_secs: default_retention_window(),
            sweep_interval_secs: default_sweep_interval(),
            batch_size: default_sweep_batch(),
        }
    }
}

impl RetentionConfig {
    pub fn settings(&self) -> RetentionSettings {
        RetentionSettings {
            window: Duration::from_secs(self.window_secs),
            batch_size: self.batch_size,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_stuck_pending")]
    pub stuck_pending_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_reconcile_batch")]
    pub batch_size: u64,
}

fn default_stuck_pending() -> u64 {
    5 * 60
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_reconcile_batch() -> u64 {
    100
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stuck_pending_secs: default_stuck_pending(),
            interval_secs: default_reconcile_interval(),
            batch_size: default_reconcile_batch(),
        }
    }
}

impl ReconcileConfig {
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            stuck_after: Duration::from_secs(self.stuck_pending_secs),
            batch_size: self.batch_size,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
