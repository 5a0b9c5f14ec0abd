//! Configuration module for Tandem
//!
//! Loads and validates the TOML configuration of a cutover run, with
//! sensible defaults for every optional value.
//!
//! # Example
//!
//! ```toml
//! tables = ["users", "orders"]
//!
//! [sync]
//! batch_size = 500
//! conflict_tie_break = "blue"
//!
//! [cutover]
//! lag_threshold_secs = 1.0
//! grace_period_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TandemError};

/// Main configuration structure for a cutover run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    /// Tables kept in sync and verified during the migration
    pub tables: Vec<String>,

    /// Replication pipeline settings
    pub sync: SyncConfig,

    /// Consistency verification settings
    pub verify: VerifyConfig,

    /// Cutover state machine settings
    pub cutover: CutoverConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Durable state configuration
    pub state: StateConfig,
}

impl Default for TandemConfig {
    fn default() -> Self {
        Self {
            tables: vec!["users".to_string(), "orders".to_string()],
            sync: SyncConfig::default(),
            verify: VerifyConfig::default(),
            cutover: CutoverConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl TandemConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TandemError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| TandemError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Render the configuration as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TandemError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(TandemError::Config(
                "At least one table must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if table.trim().is_empty() {
                return Err(TandemError::Config("Table names cannot be empty".to_string()));
            }
            if !seen.insert(table.as_str()) {
                return Err(TandemError::Config(format!(
                    "Table '{}' is listed more than once",
                    table
                )));
            }
        }

        self.sync.validate()?;
        self.verify.validate()?;
        self.cutover.validate()?;
        Ok(())
    }
}

/// Which side wins when two conflicting writes carry the same commit time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictTieBreak {
    /// The original database wins ties
    #[default]
    Blue,

    /// The new database wins ties
    Green,
}

/// Replication pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of change records captured per batch
    pub batch_size: usize,

    /// Sleep between polls when a pipeline has drained (milliseconds)
    pub poll_interval_ms: u64,

    /// Base delay for exponential backoff on transient errors (milliseconds)
    pub backoff_base_ms: u64,

    /// Maximum backoff delay cap (milliseconds)
    pub backoff_max_ms: u64,

    /// Tie-break side for the last-writer-wins conflict policy
    pub conflict_tie_break: ConflictTieBreak,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval_ms: 50,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            conflict_tie_break: ConflictTieBreak::Blue,
        }
    }
}

impl SyncConfig {
    /// Idle poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff base delay
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff delay cap
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TandemError::Config("sync.batch_size cannot be 0".to_string()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(TandemError::Config(
                "sync.backoff_base_ms cannot exceed sync.backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Consistency verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Rows fetched per ordered scan page
    pub page_size: usize,

    /// Maximum keys kept per report category for operator display
    pub mismatch_sample_size: usize,

    /// Consecutive clean reports required before consistency is trusted
    pub clean_runs_required: u32,

    /// Dirty verification runs tolerated before the attempt fails
    pub retry_budget: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            mismatch_sample_size: 10,
            clean_runs_required: 2,
            retry_budget: 5,
        }
    }
}

impl VerifyConfig {
    fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(TandemError::Config("verify.page_size cannot be 0".to_string()));
        }
        if self.clean_runs_required < 2 {
            return Err(TandemError::Config(
                "verify.clean_runs_required must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cutover state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CutoverConfig {
    /// Maximum acceptable replication lag before verification (seconds)
    pub lag_threshold_secs: f64,

    /// How long lag must stay under the threshold (milliseconds)
    pub grace_period_ms: u64,

    /// How long the final drain may take before rolling back (milliseconds)
    pub drain_timeout_ms: u64,

    /// Maximum age of the last clean verification at switch time (milliseconds)
    pub freshness_window_ms: u64,

    /// Interval between state machine evaluations (milliseconds)
    pub tick_interval_ms: u64,

    /// Advance past Syncing without an explicit operator cutover request
    pub auto_cutover: bool,
}

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            lag_threshold_secs: 1.0,
            grace_period_ms: 5_000,
            drain_timeout_ms: 30_000,
            freshness_window_ms: 60_000,
            tick_interval_ms: 250,
            auto_cutover: false,
        }
    }
}

impl CutoverConfig {
    /// Lag threshold
    pub fn lag_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.lag_threshold_secs)
    }

    /// Grace period
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Drain timeout
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Freshness window
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    /// Tick interval
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.lag_threshold_secs.is_finite() || self.lag_threshold_secs <= 0.0 {
            return Err(TandemError::Config(
                "cutover.lag_threshold_secs must be a positive number".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(TandemError::Config(
                "cutover.tick_interval_ms cannot be 0".to_string(),
            ));
        }
        if self.drain_timeout_ms == 0 {
            return Err(TandemError::Config(
                "cutover.drain_timeout_ms cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus endpoint
    pub enabled: bool,

    /// Metrics HTTP endpoint port
    pub port: u16,

    /// Metrics HTTP endpoint bind address
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9464,
            bind: "127.0.0.1".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Get the full metrics endpoint address
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

/// Durable state configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding the persisted cutover record (None keeps it in memory)
    pub data_dir: Option<PathBuf>,
}
