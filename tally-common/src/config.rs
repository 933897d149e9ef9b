//! Bootstrap configuration loading
//!
//! Resolution order for the config file:
//! 1. Command-line argument (highest priority)
//! 2. `TALLY_CONFIG` environment variable
//! 3. Platform config file (`~/.config/tally/config.toml`, then `/etc/tally/config.toml`)
//! 4. Compiled defaults (fallback)
//!
//! A missing or unreadable file never aborts startup: the loader falls back to
//! defaults and reports why through [`ConfigSource`].

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "TALLY_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stats: StatsSettings,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            bind_address: default_bind_address(),
            port: default_port(),
            logging: LoggingConfig::default(),
            stats: StatsSettings::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Tunables for validation, repair and the leaderboard
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsSettings {
    /// Points above this value on a single check-in produce a warning
    pub high_points_threshold: i64,
    /// Bound applied to every store call
    pub store_timeout_ms: u64,
    /// Users validated/repaired concurrently during a batch
    pub batch_concurrency: usize,
    /// Users fetched per page during a batch
    pub batch_page_size: usize,
    /// Upper limit accepted for `maxUsers`
    pub max_batch_users: usize,
    /// Upper limit for `userIds` on the validate endpoint
    pub max_validate_users: usize,
    pub leaderboard_default_limit: usize,
    pub leaderboard_max_limit: usize,
    /// Total backoff budget for the trigger's repair step
    pub trigger_retry_max_wait_ms: u64,
    pub notification_capacity: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            high_points_threshold: 100,
            store_timeout_ms: 5000,
            batch_concurrency: 4,
            batch_page_size: 50,
            max_batch_users: 1000,
            max_validate_users: 50,
            leaderboard_default_limit: 100,
            leaderboard_max_limit: 500,
            trigger_retry_max_wait_ms: 2000,
            notification_capacity: 256,
        }
    }
}

impl StatsSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Reject settings that would make the services misbehave
    pub fn validate(&self) -> Result<()> {
        if self.store_timeout_ms == 0 {
            return Err(Error::Config("store_timeout_ms must be positive".to_string()));
        }
        if self.batch_concurrency == 0 || self.batch_page_size == 0 {
            return Err(Error::Config(
                "batch_concurrency and batch_page_size must be positive".to_string(),
            ));
        }
        if self.leaderboard_default_limit == 0
            || self.leaderboard_default_limit > self.leaderboard_max_limit
        {
            return Err(Error::Config(format!(
                "leaderboard_default_limit must be in 1..={}",
                self.leaderboard_max_limit
            )));
        }
        if self.notification_capacity == 0 {
            return Err(Error::Config("notification_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tally").join("tally.db"))
        .unwrap_or_else(|| PathBuf::from("./tally_data/tally.db"))
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5740
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Locate the config file, honoring CLI and environment overrides
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config locations
    let user_config = dirs::config_dir().map(|d| d.join("tally").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }
    let system_config = PathBuf::from("/etc/tally/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Parsed from this file
    File(PathBuf),
    /// No config file found anywhere
    Defaults,
    /// A file was found but could not be used
    Fallback { path: PathBuf, reason: String },
}

impl TomlConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.stats.validate()?;
        Ok(config)
    }

    /// Read and parse a specific file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration, degrading to defaults when no usable file exists
    ///
    /// Does not log; callers report the returned source once tracing is up.
    pub fn load(cli_arg: Option<&Path>) -> (Self, ConfigSource) {
        let Some(path) = resolve_config_path(cli_arg) else {
            return (Self::default(), ConfigSource::Defaults);
        };

        match Self::from_path(&path) {
            Ok(config) => (config, ConfigSource::File(path)),
            Err(e) => (
                Self::default(),
                ConfigSource::Fallback {
                    path,
                    reason: e.to_string(),
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.port, 5740);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.stats.leaderboard_max_limit, 500);
        assert_eq!(config.stats.max_validate_users, 50);
        assert!(config.stats.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            port = 6000
            [stats]
            high_points_threshold = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.stats.high_points_threshold, 250);
        assert_eq!(config.stats.store_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_stats_rejected() {
        let err = TomlConfig::from_toml_str(
            r#"
            [stats]
            batch_concurrency = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(TomlConfig::from_toml_str("port = \"not a number\"").is_err());
    }

    #[test]
    #[serial]
    fn test_cli_path_wins_over_env() {
        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/env.toml");
        let cli = PathBuf::from("/nonexistent/cli.toml");
        assert_eq!(resolve_config_path(Some(&cli)), Some(cli.clone()));
        assert_eq!(
            resolve_config_path(None),
            Some(PathBuf::from("/nonexistent/env.toml"))
        );
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_load_falls_back_to_defaults_on_unreadable_file() {
        let (config, source) = TomlConfig::load(Some(Path::new("/nonexistent/tally.toml")));
        assert_eq!(config.port, 5740);
        assert!(matches!(source, ConfigSource::Fallback { .. }));
    }

    #[test]
    #[serial]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 7001\n[logging]\nlevel = \"debug\"").unwrap();
        let (config, source) = TomlConfig::load(Some(file.path()));
        assert_eq!(source, ConfigSource::File(file.path().to_path_buf()));
        assert_eq!(config.port, 7001);
        assert_eq!(config.logging.level, "debug");
    }
}
