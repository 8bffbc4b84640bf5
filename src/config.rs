//! Engine configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables:
//!
//! - `FLUX_HLL_PRECISION`: HyperLogLog precision `b`, 4..=16 (default: 10)
//! - `STORED_QUERY_TTL`: lifetime of stored union results in seconds (default: 300)
//! - `FLUX_LEADERBOARD_SIZE`: default SpaceSaving table size (default: 10)
//! - `FLUX_MAX_QUERY_RESULTS`: page size cap for set queries (default: 50)
//! - `READ_ONLY`: reject event ingestion (default: false)
//! - `FLUX_WORKERS`: event worker tasks (default: 4)
//! - `FLUX_QUEUE_CAPACITY`: pending event queue bound (default: 10000)
//! - `FLUX_SCHEMA_PATH`: schema JSON registered at startup (optional)
//! - `FLUX_LOG_LEVEL`: default tracing level when `RUST_LOG` is unset (default: info)
//! - `FLUX_LOG_FORMAT`: `text` or `json` (default: text)

use crate::error::FluxError;
use crate::hll::{MAX_PRECISION, MIN_PRECISION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "invalid TOML: {}", e),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<ConfigError> for FluxError {
    fn from(e: ConfigError) -> Self {
        FluxError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxConfig {
    pub hyperloglog_precision: u32,
    pub stored_query_ttl_secs: u64,
    pub default_leaderboard_size: usize,
    pub max_query_results: usize,
    pub read_only: bool,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub schema_path: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for FluxConfig {
    fn default() -> Self {
        FluxConfig {
            hyperloglog_precision: 10,
            stored_query_ttl_secs: 300,
            default_leaderboard_size: 10,
            max_query_results: 50,
            read_only: false,
            worker_count: 4,
            queue_capacity: 10_000,
            schema_path: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl FluxConfig {
    /// Defaults overridden by the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = FluxConfig::default();
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// TOML file overridden by the environment
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    /// Apply overrides from a variable lookup. Unparsable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("FLUX_HLL_PRECISION").and_then(|s| s.parse().ok()) {
            self.hyperloglog_precision = v;
        }
        if let Some(v) = var("STORED_QUERY_TTL").and_then(|s| s.parse().ok()) {
            self.stored_query_ttl_secs = v;
        }
        if let Some(v) = var("FLUX_LEADERBOARD_SIZE").and_then(|s| s.parse().ok()) {
            self.default_leaderboard_size = v;
        }
        if let Some(v) = var("FLUX_MAX_QUERY_RESULTS").and_then(|s| s.parse().ok()) {
            self.max_query_results = v;
        }
        if let Some(v) = var("READ_ONLY") {
            self.read_only = v == "true" || v == "1";
        }
        if let Some(v) = var("FLUX_WORKERS").and_then(|s| s.parse().ok()) {
            self.worker_count = v;
        }
        if let Some(v) = var("FLUX_QUEUE_CAPACITY").and_then(|s| s.parse().ok()) {
            self.queue_capacity = v;
        }
        if let Some(v) = var("FLUX_SCHEMA_PATH") {
            self.schema_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("FLUX_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("FLUX_LOG_FORMAT").and_then(|s| LogFormat::parse(&s)) {
            self.log_format = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&self.hyperloglog_precision) {
            return Err(ConfigError::Invalid(format!(
                "hyperloglog_precision {} outside {}..={}",
                self.hyperloglog_precision, MIN_PRECISION, MAX_PRECISION
            )));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.max_query_results == 0 {
            return Err(ConfigError::Invalid("max_query_results must be positive".into()));
        }
        if self.default_leaderboard_size == 0 {
            return Err(ConfigError::Invalid(
                "default_leaderboard_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn stored_query_ttl(&self) -> Duration {
        Duration::from_secs(self.stored_query_ttl_secs)
    }
}
