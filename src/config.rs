//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_block_capacity")]
    pub block_capacity: u64,

    #[serde(default = "default_read_limit")]
    pub read_limit: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chatstore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./chatstore_data".to_string())
}

fn default_block_capacity() -> u64 {
    crate::storage::DEFAULT_BLOCK_CAPACITY
}

fn default_read_limit() -> usize {
    crate::storage::DEFAULT_READ_LIMIT
}

fn default_chunk_size() -> u64 {
    crate::accounts::DEFAULT_CHUNK_SIZE
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            block_capacity: default_block_capacity(),
            read_limit: default_read_limit(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl From<&StorageConfig> for crate::storage::StorageConfig {
    fn from(config: &StorageConfig) -> Self {
        crate::storage::StorageConfig::new(expand_home(&config.data_dir))
            .block_capacity(config.block_capacity)
            .read_limit(config.read_limit)
            .chunk_size(config.chunk_size)
    }
}

/// Resolve a leading `~/` against the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
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
            dirs::config_dir().map(|p| p.join("chatstore").join("config.toml")),
            Some(PathBuf::from("/etc/chatstore/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Storage overrides
        if let Some(data_dir) = lookup("CHATSTORE_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Some(capacity) = lookup("CHATSTORE_BLOCK_CAPACITY") {
            match capacity.parse() {
                Ok(c) => self.storage.block_capacity = c,
                Err(_) => tracing::warn!("Ignoring CHATSTORE_BLOCK_CAPACITY={}", capacity),
            }
        }
        if let Some(limit) = lookup("CHATSTORE_READ_LIMIT") {
            match limit.parse() {
                Ok(l) => self.storage.read_limit = l,
                Err(_) => tracing::warn!("Ignoring CHATSTORE_READ_LIMIT={}", limit),
            }
        }
        if let Some(size) = lookup("CHATSTORE_CHUNK_SIZE") {
            match size.parse() {
                Ok(s) => self.storage.chunk_size = s,
                Err(_) => tracing::warn!("Ignoring CHATSTORE_CHUNK_SIZE={}", size),
            }
        }

        // Logging overrides
        if let Some(level) = lookup("CHATSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CHATSTORE_LOG_FORMAT") {
            self.logging.format = format;
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
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chatstore Configuration
#
# Environment variables override these settings:
# - CHATSTORE_DATA_DIR
# - CHATSTORE_BLOCK_CAPACITY
# - CHATSTORE_READ_LIMIT
# - CHATSTORE_CHUNK_SIZE
# - CHATSTORE_LOG_LEVEL
# - CHATSTORE_LOG_FORMAT

[storage]
# Directory holding messages/, logs/, accounts.tree and blobs.heap
data_dir = "~/.local/share/chatstore"

# Entries per block file before a new block is started
block_capacity = 1000

# Reads allowed in flight per stream; further reads queue
read_limit = 20

# Blob heap chunk size (bytes). Fixed once the heap file exists.
chunk_size = 128

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
