//! Configuration management for the Parley client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/parley/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::crypto::RatchetLimits;
use protocol::NodeCodec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fanout::FanoutConfig;
use crate::signal::RepositoryConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("url must start with ws:// or wss://, got {0}")]
    InvalidUrl(String),

    #[error("query_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidQueryTimeout(u64),

    #[error("connect_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("keepalive_interval_secs must be between 0 and 3600, got {0}")]
    InvalidKeepaliveInterval(u64),

    #[error("max_skip must be between 1 and 100000, got {0}")]
    InvalidMaxSkip(u32),

    #[error("max_cached_keys must be greater than 0, got {0}")]
    InvalidMaxCachedKeys(usize),

    #[error("max_archived_states must be at most 1000, got {0}")]
    InvalidMaxArchivedStates(usize),

    #[error("compression_threshold must be at least 64, got {0}")]
    InvalidCompressionThreshold(usize),

    #[error("max_depth must be between 1 and 512, got {0}")]
    InvalidMaxDepth(usize),

    #[error("sender_key_threshold must be greater than 0, got {0}")]
    InvalidSenderKeyThreshold(usize),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Parley client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Server connection settings.
    pub connection: ConnectionConfig,

    /// Session store and ratchet settings.
    pub session: SessionConfig,

    /// Wire codec settings.
    pub codec: CodecConfig,

    /// Device fan-out settings.
    pub fanout: FanoutConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint.
    pub url: String,

    /// Seconds a query waits for its response.
    pub query_timeout_secs: u64,

    /// Seconds between keepalive pings (0 = disabled).
    pub keepalive_interval_secs: u64,

    /// Seconds allowed for establishing the transport.
    pub connect_timeout_secs: u64,
}

/// Session store and ratchet settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Path of the session store document.
    pub store_path: PathBuf,

    /// Largest counter gap tolerated on one chain before the session is
    /// considered out of sync.
    pub max_skip: u32,

    /// Skipped message keys cached per session; oldest are evicted first.
    pub max_cached_keys: usize,

    /// Replaced session states kept per device.
    pub max_archived_states: usize,
}

/// Wire codec settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CodecConfig {
    /// Encoded node size (bytes) above which frames are compressed.
    pub compression_threshold: usize,

    /// Maximum nesting depth accepted when decoding.
    pub max_depth: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Optional log file; rotated daily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "wss://web.whatsapp.com/ws/chat".to_string(),
            query_timeout_secs: 60,
            keepalive_interval_secs: 30,
            connect_timeout_secs: 20,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = RepositoryConfig::default();
        Self {
            store_path: default_data_dir().join("sessions.json"),
            max_skip: defaults.limits.max_skip,
            max_cached_keys: defaults.limits.max_cached_keys,
            max_archived_states: defaults.max_archived_states,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: protocol::COMPRESSION_THRESHOLD,
            max_depth: protocol::DEFAULT_MAX_DEPTH,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ConnectionConfig {
    /// Query timeout as a duration.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Keepalive interval, or `None` when disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SessionConfig {
    /// Repository tunables.
    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            limits: RatchetLimits {
                max_skip: self.max_skip,
                max_cached_keys: self.max_cached_keys,
            },
            max_archived_states: self.max_archived_states,
        }
    }
}

impl CodecConfig {
    /// Codec configured with these settings.
    pub fn node_codec(&self) -> NodeCodec {
        NodeCodec::new()
            .with_compression_threshold(self.compression_threshold)
            .with_max_depth(self.max_depth)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
        .join("config.toml")
}

/// Returns the default data directory path.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PARLEY_URL: Override the server URL
    /// - PARLEY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PARLEY_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding url from environment: {}", url);
                self.connection.url = url;
            }
        }

        if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        let url = &connection.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidUrl(url.clone()));
        }

        if !(1..=3600).contains(&connection.query_timeout_secs) {
            return Err(ConfigError::InvalidQueryTimeout(connection.query_timeout_secs));
        }

        if !(1..=3600).contains(&connection.connect_timeout_secs) {
            return Err(ConfigError::InvalidConnectTimeout(
                connection.connect_timeout_secs,
            ));
        }

        // 0 disables keepalive
        if connection.keepalive_interval_secs > 3600 {
            return Err(ConfigError::InvalidKeepaliveInterval(
                connection.keepalive_interval_secs,
            ));
        }

        let session = &self.session;
        if !(1..=100_000).contains(&session.max_skip) {
            return Err(ConfigError::InvalidMaxSkip(session.max_skip));
        }

        if session.max_cached_keys == 0 {
            return Err(ConfigError::InvalidMaxCachedKeys(session.max_cached_keys));
        }

        if session.max_archived_states > 1000 {
            return Err(ConfigError::InvalidMaxArchivedStates(
                session.max_archived_states,
            ));
        }

        if self.codec.compression_threshold < 64 {
            return Err(ConfigError::InvalidCompressionThreshold(
                self.codec.compression_threshold,
            ));
        }

        if !(1..=512).contains(&self.codec.max_depth) {
            return Err(ConfigError::InvalidMaxDepth(self.codec.max_depth));
        }

        if self.fanout.sender_key_threshold == 0 {
            return Err(ConfigError::InvalidSenderKeyThreshold(
                self.fanout.sender_key_threshold,
            ));
        }

        // Validate log level is a known value
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save_default(&self) -> Result<()> {
        self.save(default_config_path())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.connection.url, "wss://web.whatsapp.com/ws/chat");
        assert_eq!(config.connection.query_timeout_secs, 60);
        assert_eq!(config.connection.keepalive_interval_secs, 30);
        assert_eq!(config.session.max_skip, 2000);
        assert_eq!(config.session.max_cached_keys, 2000);
        assert_eq!(config.session.max_archived_states, 40);
        assert_eq!(config.codec.compression_threshold, 1024);
        assert_eq!(config.codec.max_depth, 64);
        assert_eq!(config.fanout.sender_key_threshold, 2);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_store_path() {
        let config = SessionConfig::default();
        assert!(config.store_path.to_string_lossy().contains("parley"));
        assert!(config.store_path.ends_with("sessions.json"));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[session]
max_skip = 500

[logging]
level = "debug"
file = "/tmp/parley.log"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.session.max_skip, 500);
        assert_eq!(config.session.max_cached_keys, 2000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/parley.log")));
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[connection\nurl = ");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_skip = "many"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.connection.url = "ws://localhost:8080/ws".to_string();
        original.codec.max_depth = 32;
        original.fanout.sender_key_threshold = 5;
        original.logging.file = Some(PathBuf::from("/var/log/parley.log"));

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir
            .path()
            .join("nested")
            .join("dirs")
            .join("config.toml");

        let mut config = Config::default();
        config.session.max_archived_states = 7;
        config.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(Config::load(&config_path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "not valid toml [[[").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config::default();
        config.connection.url = "https://example.com".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidUrl("https://example.com".to_string()))
        );

        let mut config = Config::default();
        config.connection.query_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueryTimeout(0)));

        let mut config = Config::default();
        config.connection.keepalive_interval_secs = 0;
        assert!(config.validate().is_ok());
        assert!(config.connection.keepalive_interval().is_none());

        let mut config = Config::default();
        config.session.max_skip = 100_001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSkip(100_001)));

        let mut config = Config::default();
        config.session.max_cached_keys = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxCachedKeys(0)));

        let mut config = Config::default();
        config.codec.compression_threshold = 10;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCompressionThreshold(10))
        );

        let mut config = Config::default();
        config.codec.max_depth = 513;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxDepth(513)));

        let mut config = Config::default();
        config.fanout.sender_key_threshold = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSenderKeyThreshold(0))
        );

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConfigError::InvalidMaxSkip(0).to_string(),
            "max_skip must be between 1 and 100000, got 0"
        );
        assert_eq!(
            ConfigError::InvalidUrl("http://x".to_string()).to_string(),
            "url must start with ws:// or wss://, got http://x"
        );
    }

    #[test]
    fn test_runtime_conversions() {
        let mut config = Config::default();
        config.session.max_skip = 10;
        config.codec.max_depth = 16;

        let repository = config.session.repository_config();
        assert_eq!(repository.limits.max_skip, 10);
        assert_eq!(repository.max_archived_states, 40);
        assert_eq!(config.codec.node_codec().max_depth(), 16);
        assert_eq!(config.connection.query_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.connection.keepalive_interval(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_url() {
        let mut config = Config::default();
        std::env::set_var("PARLEY_URL", "wss://relay.example.com/ws");
        config.apply_env_overrides();
        std::env::remove_var("PARLEY_URL");

        assert_eq!(config.connection.url, "wss://relay.example.com/ws");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        let mut config = Config::default();
        std::env::set_var("PARLEY_LOG_LEVEL", "");
        config.apply_env_overrides();
        std::env::remove_var("PARLEY_LOG_LEVEL");

        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        let mut config = Config::default();
        std::env::set_var("PARLEY_LOG_LEVEL", "trace");
        config.apply_env_overrides();
        std::env::remove_var("PARLEY_LOG_LEVEL");

        assert_eq!(config.logging.level, "trace");
    }
}
