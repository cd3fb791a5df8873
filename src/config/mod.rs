//! Engine configuration
//!
//! Loaded from a TOML file. Every field has a default so a partial file (or
//! no file at all) yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "CRITIC_CONFIG";

/// Top-level configuration for runner, broker and workers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub pubsub: PubsubConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub highlight: HighlightConfig,
}

/// Location of the persistent cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// Job runner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on concurrently executing local jobs
    #[serde(default = "cpu_count")]
    pub max_workers: usize,

    /// Seconds between fallback scans for new work
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Changed files per examination job
    #[serde(default = "default_examine_chunk")]
    pub examine_chunk: usize,

    /// Files per file-difference job
    #[serde(default = "default_file_difference_chunk")]
    pub file_difference_chunk: usize,

    /// Maximum summed `delete_length * insert_length` per analysis job
    #[serde(default = "default_analysis_cost_limit")]
    pub analysis_cost_limit: usize,
}

/// Pub/sub transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubsubConfig {
    /// Dispatch worker jobs through the broker instead of in-process
    #[serde(default)]
    pub enabled: bool,

    /// Broker listen/connect address
    #[serde(default = "default_pubsub_address")]
    pub address: String,

    /// Total deadline of one request round
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deadline of one delivery attempt
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
}

/// Worker service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Requests this worker accepts concurrently
    #[serde(default = "cpu_count")]
    pub parallel_requests: usize,

    /// Flush when the oldest queued write is this old
    #[serde(default = "default_flush_max_age")]
    pub flush_max_age_ms: u64,

    /// Flush when no write arrived for this long
    #[serde(default = "default_flush_idle")]
    pub flush_idle_ms: u64,

    /// Handler channels to subscribe to
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

/// Syntax highlighting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightConfig {
    /// Encodings tried in order; the last one is forced with replacement
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,

    /// Files larger than this are recorded without tokens
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

/// Number of CPUs available to this process
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("critic.db")
}

fn default_scan_interval() -> u64 {
    30
}

fn default_examine_chunk() -> usize {
    100
}

fn default_file_difference_chunk() -> usize {
    10
}

fn default_analysis_cost_limit() -> usize {
    5000
}

fn default_pubsub_address() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_flush_max_age() -> u64 {
    500
}

fn default_flush_idle() -> u64 {
    100
}

fn default_channels() -> Vec<String> {
    crate::worker::CHANNELS.iter().map(|c| c.to_string()).collect()
}

fn default_encodings() -> Vec<String> {
    vec!["utf-8".to_string(), "latin-1".to_string()]
}

fn default_max_file_bytes() -> usize {
    1024 * 1024
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: cpu_count(),
            scan_interval_secs: default_scan_interval(),
            examine_chunk: default_examine_chunk(),
            file_difference_chunk: default_file_difference_chunk(),
            analysis_cost_limit: default_analysis_cost_limit(),
        }
    }
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_pubsub_address(),
            request_timeout_secs: default_request_timeout(),
            delivery_timeout_secs: default_delivery_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallel_requests: cpu_count(),
            flush_max_age_ms: default_flush_max_age(),
            flush_idle_ms: default_flush_idle(),
            channels: default_channels(),
        }
    }
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            encodings: default_encodings(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

impl RunnerConfig {
    /// Pool size actually used: the configured size capped at the CPU count
    pub fn effective_workers(&self) -> usize {
        self.max_workers.clamp(1, cpu_count().max(1))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

impl PubsubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

impl WorkerConfig {
    pub fn flush_max_age(&self) -> Duration {
        Duration::from_millis(self.flush_max_age_ms)
    }

    pub fn flush_idle(&self) -> Duration {
        Duration::from_millis(self.flush_idle_ms)
    }
}

impl EngineConfig {
    /// Resolve the configuration file: explicit path, then `CRITIC_CONFIG`,
    /// then `critic.toml` in the user configuration directory
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|dir| dir.join("critic").join("critic.toml"))
    }

    /// Load configuration from `path` or return defaults when it does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let Some(config_path) = Self::resolve_path(path) else {
            return Ok(Self::default());
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
            let config: EngineConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
