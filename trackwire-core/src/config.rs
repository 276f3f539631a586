//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/trackwire/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/trackwire/` (~/.config/trackwire/)
//! - Data: `$XDG_DATA_HOME/trackwire/` (~/.local/share/trackwire/)
//! - State/Logs: `$XDG_STATE_HOME/trackwire/` (~/.local/state/trackwire/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Largest number of events sent in one bulk request
pub const MAX_BATCH_SIZE: usize = 10;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Persistent dispatch queue limits
    #[serde(default)]
    pub queue: QueueConfig,

    /// Batching and release policy
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Session lifetime
    #[serde(default)]
    pub session: SessionConfig,

    /// Webview tag management dispatcher
    #[serde(default)]
    pub tag_management: TagManagementConfig,

    /// HTTP collect dispatcher
    #[serde(default)]
    pub collect: CollectConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Persistent dispatch queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum number of events held in the queue; oldest are dropped first
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Seconds after which a queued event expires (unset = until cleared)
    #[serde(default)]
    pub expiration_secs: Option<u64>,

    /// Seconds between expired-entry purges
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Override for the durable store location
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            expiration_secs: None,
            purge_interval_secs: default_purge_interval(),
            database_path: None,
        }
    }
}

impl QueueConfig {
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration_secs.map(Duration::from_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn default_max_queue_size() -> usize {
    40
}

fn default_purge_interval() -> u64 {
    1800
}

/// Batching and release configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    /// Hold events in the queue and release them in batches
    #[serde(default)]
    pub enabled: bool,

    /// Number of queued events that triggers a release (max 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Event names that are never queued
    #[serde(default = "default_bypass_keys")]
    pub bypass_keys: BTreeSet<String>,

    /// Release queued events this many seconds after the first was queued
    #[serde(default)]
    pub dispatch_after_seconds: Option<f64>,

    /// Treat cellular connectivity as offline
    #[serde(default)]
    pub wifi_only: bool,

    /// Hold batchable events while the host reports low power
    #[serde(default)]
    pub battery_saver: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_batch_size(),
            bypass_keys: default_bypass_keys(),
            dispatch_after_seconds: None,
            wifi_only: false,
            battery_saver: false,
        }
    }
}

impl BatchingConfig {
    pub fn dispatch_after(&self) -> Option<Duration> {
        self.dispatch_after_seconds
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_bypass_keys() -> BTreeSet<String> {
    [
        "wake",
        "grant_full_consent",
        "grant_partial_consent",
        "decline_consent",
        "update_consent_cookie",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Session configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Seconds of inactivity after which a new session starts
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_session_timeout() -> u64 {
    1800
}

/// Tag management dispatcher configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TagManagementConfig {
    /// Enable the webview dispatcher
    #[serde(default)]
    pub enabled: bool,

    /// Page loaded into the runtime
    pub url: Option<String>,

    /// Requests held while the runtime is not ready; oldest dropped first
    #[serde(default = "default_max_pending")]
    pub max_pending_requests: usize,

    /// Capacity of the remote command channel
    #[serde(default = "default_remote_command_buffer")]
    pub remote_command_buffer: usize,
}

impl Default for TagManagementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            max_pending_requests: default_max_pending(),
            remote_command_buffer: default_remote_command_buffer(),
        }
    }
}

fn default_max_pending() -> usize {
    100
}

fn default_remote_command_buffer() -> usize {
    64
}

/// HTTP method used for single events
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollectMethod {
    #[default]
    Post,
    Get,
}

/// Collect dispatcher configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectConfig {
    /// Enable/disable the HTTP dispatcher
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint for single events
    pub url: Option<String>,

    /// Endpoint for gzip-compressed batches (defaults to `url`)
    pub bulk_url: Option<String>,

    /// Method for single events
    #[serde(default)]
    pub method: CollectMethod,

    /// HTTP request timeout in seconds
    #[serde(default = "default_collect_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            bulk_url: None,
            method: CollectMethod::default(),
            timeout_secs: default_collect_timeout(),
        }
    }
}

impl CollectConfig {
    /// Check if the dispatcher is enabled and has somewhere to send
    pub fn is_ready(&self) -> bool {
        self.enabled && self.url.is_some()
    }

    pub fn bulk_endpoint(&self) -> Option<&str> {
        self.bulk_url.as_deref().or(self.url.as_deref())
    }
}

fn default_collect_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.batching.batch_size == 0 || self.batching.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "batching.batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if let Some(secs) = self.batching.dispatch_after_seconds {
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::Config(
                    "batching.dispatch_after_seconds must be a non-negative number".to_string(),
                ));
            }
        }
        if self.queue.purge_interval_secs == 0 {
            return Err(Error::Config(
                "queue.purge_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.collect.enabled && self.collect.url.is_none() {
            return Err(Error::Config(
                "collect.url is required when collect is enabled".to_string(),
            ));
        }
        if self.tag_management.enabled && self.tag_management.url.is_none() {
            return Err(Error::Config(
                "tag_management.url is required when tag_management is enabled".to_string(),
            ));
        }
        if self.tag_management.remote_command_buffer == 0 {
            return Err(Error::Config(
                "tag_management.remote_command_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/trackwire/config.toml` (~/.config/trackwire/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("trackwire").join("config.toml")
    }

    /// Returns the data directory path (for the durable store)
    ///
    /// `$XDG_DATA_HOME/trackwire/` (~/.local/share/trackwire/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("trackwire")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/trackwire/` (~/.local/state/trackwire/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("trackwire")
    }

    /// Returns the durable store path, honoring `queue.database_path`
    ///
    /// `$XDG_DATA_HOME/trackwire/data.db` (~/.local/share/trackwire/data.db)
    pub fn database_path(&self) -> PathBuf {
        self.queue
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("data.db"))
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/trackwire/trackwire.log` (~/.local/state/trackwire/trackwire.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("trackwire.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.max_queue_size, 40);
        assert!(config.queue.expiration().is_none());
        assert!(!config.batching.enabled);
        assert_eq!(config.batching.batch_size, MAX_BATCH_SIZE);
        assert!(config.batching.bypass_keys.contains("wake"));
        assert_eq!(config.session.timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[queue]
max_queue_size = 200
expiration_secs = 86400

[batching]
enabled = true
batch_size = 5
bypass_keys = ["wake", "launch"]
dispatch_after_seconds = 2.5
wifi_only = true

[tag_management]
enabled = true
url = "https://tags.example.com/mobile.html"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.queue.max_queue_size, 200);
        assert_eq!(config.queue.expiration(), Some(Duration::from_secs(86400)));
        assert!(config.batching.enabled);
        assert_eq!(config.batching.batch_size, 5);
        assert!(config.batching.bypass_keys.contains("launch"));
        assert!(!config.batching.bypass_keys.contains("decline_consent"));
        assert_eq!(
            config.batching.dispatch_after(),
            Some(Duration::from_millis(2500))
        );
        assert!(config.batching.wifi_only);
        assert_eq!(config.tag_management.max_pending_requests, 100);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut config = Config::default();
        config.batching.batch_size = 0;
        assert!(config.validate().is_err());

        config.batching.batch_size = MAX_BATCH_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collect_config_validation() {
        // Disabled config is always valid
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.collect.is_ready());

        // Enabled without a url should fail
        config.collect.enabled = true;
        assert!(config.validate().is_err());

        config.collect.url = Some("https://collect.example.com/event".to_string());
        assert!(config.validate().is_ok());
        assert!(config.collect.is_ready());
        assert_eq!(
            config.collect.bulk_endpoint(),
            Some("https://collect.example.com/event")
        );
    }

    #[test]
    fn test_parse_collect_method() {
        let toml = r#"
[collect]
enabled = true
url = "https://collect.example.com/event"
bulk_url = "https://collect.example.com/bulk-event"
method = "get"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.collect.method, CollectMethod::Get);
        assert_eq!(
            config.collect.bulk_endpoint(),
            Some("https://collect.example.com/bulk-event")
        );
    }

    #[test]
    fn test_database_path_override() {
        let mut config = Config::default();
        assert!(config.database_path().ends_with("trackwire/data.db"));

        config.queue.database_path = Some(PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/custom.db"));
    }
}
