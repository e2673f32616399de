//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::index::VectorIndexConfig;
use crate::storage::block::BlockOptions;
use crate::storage::chain::{ChainOptions, HEAD_BUFFER_MINUTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub vector: VectorConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_block_duration")]
    pub block_duration_hours: u64,

    #[serde(default = "default_retention")]
    pub retention_hours: u64,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_chunk_max_bytes")]
    pub chunk_max_bytes: u64,

    #[serde(default = "default_embedding_chunk_chars")]
    pub embedding_chunk_chars: usize,
}

fn default_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("feedline"))
        .unwrap_or_else(|| PathBuf::from("./feedline_data"))
}

fn default_block_duration() -> u64 {
    24
}

fn default_retention() -> u64 {
    8 * 24
}

fn default_flush_interval() -> u64 {
    30
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_chunk_max_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

fn default_embedding_chunk_chars() -> usize {
    2048
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            block_duration_hours: default_block_duration(),
            retention_hours: default_retention(),
            flush_interval_secs: default_flush_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            chunk_max_bytes: default_chunk_max_bytes(),
            embedding_chunk_chars: default_embedding_chunk_chars(),
        }
    }
}

impl StorageConfig {
    pub fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.block_duration_hours as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Vector index parameters for newly created blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_ml")]
    pub ml: f64,

    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    #[serde(default = "default_ef_construct")]
    pub ef_construct: usize,
}

fn default_m() -> usize {
    8
}

fn default_ml() -> f64 {
    1.0 / 32f64.ln()
}

fn default_ef_search() -> usize {
    64
}

fn default_ef_construct() -> usize {
    128
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            ml: default_ml(),
            ef_search: default_ef_search(),
            ef_construct: default_ef_construct(),
        }
    }
}

impl VectorConfig {
    pub fn index_config(&self) -> VectorIndexConfig {
        VectorIndexConfig {
            m: self.m,
            ml: self.ml,
            ef_search: self.ef_search,
            ef_construct: self.ef_construct,
        }
    }
}

/// Embedding provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Hashing,
    Openai,
}

/// Embedding provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Vector width of the hashing provider
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Hashing
}

fn default_embedding_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimension() -> usize {
    256
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            api_key: None,
            dimension: default_dimension(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("feedline").join("config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Storage overrides
        if let Some(dir) = var("FEEDLINE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(hours) = var("FEEDLINE_RETENTION_HOURS").and_then(|h| h.parse().ok()) {
            self.storage.retention_hours = hours;
        }
        if let Some(hours) = var("FEEDLINE_BLOCK_DURATION_HOURS").and_then(|h| h.parse().ok()) {
            self.storage.block_duration_hours = hours;
        }

        // Embedding overrides
        if let Some(url) = var("FEEDLINE_EMBEDDING_URL") {
            self.embedding.url = url;
        }
        if let Some(key) = var("FEEDLINE_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key);
        }

        // Logging overrides
        if let Some(level) = var("FEEDLINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("FEEDLINE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let storage = &self.storage;
        if storage.block_duration() <= chrono::Duration::minutes(HEAD_BUFFER_MINUTES) {
            return Err(ConfigError::Invalid(format!(
                "storage.block_duration_hours must exceed the {} minute head buffer",
                HEAD_BUFFER_MINUTES
            )));
        }
        if storage.retention_hours < storage.block_duration_hours {
            return Err(ConfigError::Invalid(
                "storage.retention_hours must be at least storage.block_duration_hours".into(),
            ));
        }
        if storage.flush_interval_secs == 0 || storage.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "storage intervals must be greater than zero".into(),
            ));
        }
        if storage.chunk_max_bytes == 0 || storage.embedding_chunk_chars == 0 {
            return Err(ConfigError::Invalid(
                "storage.chunk_max_bytes and storage.embedding_chunk_chars must be positive".into(),
            ));
        }

        let vector = &self.vector;
        if vector.m < 2 {
            return Err(ConfigError::Invalid("vector.m must be at least 2".into()));
        }
        if !(vector.ml > 0.0 && vector.ml < 1.0) {
            return Err(ConfigError::Invalid("vector.ml must be within (0, 1)".into()));
        }
        if vector.ef_search == 0 || vector.ef_construct == 0 {
            return Err(ConfigError::Invalid(
                "vector.ef_search and vector.ef_construct must be positive".into(),
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be positive".into()));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Block chain tunables derived from this config
    pub fn chain_options(&self) -> ChainOptions {
        ChainOptions {
            block_duration: self.storage.block_duration(),
            retention: self.storage.retention(),
            block: BlockOptions {
                flush_interval: self.storage.flush_interval(),
                chunk_max_bytes: self.storage.chunk_max_bytes,
                vector: self.vector.index_config(),
            },
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Feedline Configuration
#
# Environment variables override these settings:
# - FEEDLINE_DIR
# - FEEDLINE_RETENTION_HOURS
# - FEEDLINE_BLOCK_DURATION_HOURS
# - FEEDLINE_EMBEDDING_URL
# - FEEDLINE_EMBEDDING_API_KEY
# - FEEDLINE_LOG_LEVEL
# - FEEDLINE_LOG_FORMAT

[storage]
# Directory holding one subdirectory per block
dir = "~/.local/share/feedline"

# Time span covered by each block (hours)
block_duration_hours = 24

# Blocks ending longer ago than this are deleted (hours)
retention_hours = 192

# How often hot blocks persist their indexes (seconds)
flush_interval_secs = 30

# How often block lifecycle is reconciled (seconds)
reconcile_interval_secs = 30

# Chunk file rotation size (bytes)
chunk_max_bytes = 67108864

# Maximum characters per embedded content chunk
embedding_chunk_chars = 2048

[vector]
# Max neighbors per node per layer (doubled at layer 0)
m = 8

# Level generation probability, 1/ln(32)
ml = 0.28853900817779266

# Candidate-set sizes for search and insertion
ef_search = 64
ef_construct = 128

[embedding]
# Provider: hashing (local, offline) or openai (any compatible endpoint)
provider = "hashing"

url = "https://api.openai.com/v1"
model = "text-embedding-3-small"
# api_key = ""

# Vector width of the hashing provider
dimension = 256

request_timeout_secs = 30

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
