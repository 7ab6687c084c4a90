//! Configuration file parsing
//!
//! Parses TOML configuration files for the pack server and the content store.

use crate::htree::MIN_BLOCK_SIZE;
use crate::proto::{MIN_MESSAGE_SIZE, READ_OVERHEAD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server settings
    pub server: ServerConfig,

    /// Content store settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Served directory; packs live in `<root>/packs`, metadata in `<root>/meta.db`
    pub root: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Staged uploads older than this are removed on attach
    #[serde(default = "default_tmp_max_age_days")]
    pub tmp_max_age_days: u64,

    /// Largest frame accepted or sent, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_bind() -> String {
    "127.0.0.1:4110".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tmp_max_age_days() -> u64 {
    7
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

impl ServerConfig {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            bind: default_bind(),
            root: root.into(),
            log_level: default_log_level(),
            tmp_max_age_days: default_tmp_max_age_days(),
            max_message_size: default_max_message_size(),
        }
    }

    pub fn tmp_max_age(&self) -> Duration {
        Duration::from_secs(self.tmp_max_age_days.saturating_mul(24 * 60 * 60))
    }
}

/// Content store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Local directory for cached pack indices
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Pack handles kept open by a reader
    #[serde(default = "default_open_packs")]
    pub open_packs: usize,

    /// Hash tree block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// A writer starts a new pack once the current one passes this size
    #[serde(default = "default_max_pack_size")]
    pub max_pack_size: u64,

    /// Compress blocks with lz4 when it saves space
    #[serde(default = "default_compress")]
    pub compress: bool,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_open_packs() -> usize {
    5
}

fn default_block_size() -> usize {
    65536
}

fn default_max_pack_size() -> u64 {
    64 * 1024 * 1024
}

fn default_compress() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            open_packs: default_open_packs(),
            block_size: default_block_size(),
            max_pack_size: default_max_pack_size(),
            compress: default_compress(),
        }
    }
}

impl StoreConfig {
    /// Check the store settings on their own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.open_packs == 0 {
            return Err(ConfigError::Invalid("store.open_packs must be at least 1".to_string()));
        }
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "store.block_size {} is below the minimum of {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.max_pack_size == 0 {
            return Err(ConfigError::Invalid("store.max_pack_size must be positive".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("server.root must not be empty".to_string()));
        }
        if self.server.max_message_size < MIN_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "server.max_message_size {} is below the minimum of {}",
                self.server.max_message_size, MIN_MESSAGE_SIZE
            )));
        }
        if self.server.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "server.max_message_size does not fit in a frame header".to_string(),
            ));
        }

        self.store.validate()?;

        // one stored block (codec marker included) must fit in a read reply
        if self.store.block_size + 1 + READ_OVERHEAD > self.server.max_message_size {
            return Err(ConfigError::Invalid(format!(
                "store.block_size {} does not fit in server.max_message_size {}",
                self.store.block_size, self.server.max_message_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[server]
root = "/srv/packstore"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.server.root, PathBuf::from("/srv/packstore"));
        assert_eq!(config.server.bind, "127.0.0.1:4110");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.tmp_max_age(), Duration::from_secs(7 * 86400));
        assert_eq!(config.store.open_packs, 5);
        assert_eq!(config.store.block_size, 65536);
        assert!(config.store.compress);
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[server]
bind = "0.0.0.0:9000"
root = "/data/store"
log_level = "debug"
tmp_max_age_days = 2
max_message_size = 131072

[store]
cache_dir = "/var/cache/packstore"
open_packs = 16
block_size = 8192
max_pack_size = 1048576
compress = false
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.max_message_size, 131072);
        assert_eq!(config.store.cache_dir, PathBuf::from("/var/cache/packstore"));
        assert_eq!(config.store.open_packs, 16);
        assert_eq!(config.store.max_pack_size, 1048576);
        assert!(!config.store.compress);
    }

    #[test]
    fn test_missing_root_error() {
        let result = Config::parse("[server]\nbind = \"127.0.0.1:1\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        let result = Config::parse("[server]\nroot = \"\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_store_error() {
        let config_str = r#"
[server]
root = "/data"

[store]
open_packs = 0
"#;
        assert!(matches!(Config::parse(config_str), Err(ConfigError::Invalid(_))));

        let config_str = r#"
[server]
root = "/data"

[store]
block_size = 40
"#;
        assert!(matches!(Config::parse(config_str), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_huge_tmp_age_saturates() {
        let mut server = ServerConfig::new("/data");
        server.tmp_max_age_days = u64::MAX;
        assert_eq!(server.tmp_max_age(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_block_must_fit_message() {
        let config_str = r#"
[server]
root = "/data"
max_message_size = 65536
"#;
        // default 64 KiB blocks need a larger frame
        assert!(matches!(Config::parse(config_str), Err(ConfigError::Invalid(_))));
    }
}
