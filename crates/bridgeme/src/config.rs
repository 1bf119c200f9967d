//! Configuration management for BridgeMe.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/bridgeme/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port range must satisfy 1024 <= start < end <= 65535, got {0}-{1}")]
    InvalidPortRange(u16, u16),

    #[error("max_port_attempts must be at least 1, got {0}")]
    InvalidPortAttempts(u32),

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("retry_attempts must be between 1 and 100, got {0}")]
    InvalidRetryAttempts(u32),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("key_file does not exist: {0}")]
    InvalidKeyFile(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for BridgeMe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Session and port pool configuration.
    pub session: SessionConfig,

    /// Relay SSH server configuration.
    pub relay: RelayConfig,

    /// Client-mode configuration.
    pub client: ClientConfig,

    /// Shell and terminal configuration.
    pub terminal: TerminalConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// First port (inclusive) of the allocation range.
    pub port_range_start: u16,

    /// Last port (exclusive) of the allocation range.
    pub port_range_end: u16,

    /// Random probes before port allocation gives up.
    pub max_port_attempts: u32,

    /// Inactivity after which a session is reaped.
    pub timeout_minutes: u64,

    /// How often the expiry sweep runs.
    pub cleanup_interval_secs: u64,

    /// Delay before retrying a failed sweep.
    pub cleanup_retry_secs: u64,
}

/// Relay SSH server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Default SSH username when the destination does not name one.
    pub username: Option<String>,

    /// Private key tried before the agent and the default keys.
    pub key_file: Option<PathBuf>,

    /// Bound on connection plus authentication.
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval (0 disables keepalives).
    pub keepalive_interval_secs: u64,

    /// Address the relay server binds the remote listener to.
    /// Empty means all interfaces, subject to the server's GatewayPorts policy.
    pub bind_address: String,
}

/// Client-mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection attempts before giving up.
    pub retry_attempts: u32,

    /// Fixed delay between attempts.
    pub retry_delay_secs: u64,
}

/// How shells are attached to their I/O.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// Native PTY, falling back to pipes if no PTY can be opened.
    #[default]
    Auto,
    /// Native PTY only.
    Pty,
    /// Piped standard streams only.
    Pipe,
}

/// Shell and terminal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell to run. Detected from the platform preference order when unset.
    pub shell: Option<String>,

    /// Terminal attachment mode.
    pub mode: TerminalMode,

    /// Grace period between hang-up and forced kill.
    pub close_grace_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port_range_start: 10000,
            port_range_end: 65000,
            max_port_attempts: 100,
            timeout_minutes: 60,
            cleanup_interval_secs: 60,
            cleanup_retry_secs: 10,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            username: None,
            key_file: None,
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            bind_address: String::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_secs: 2,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            mode: TerminalMode::Auto,
            close_grace_secs: 5,
        }
    }
}

impl SessionConfig {
    /// Inactivity timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    /// Sweep interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Sweep retry delay as a duration.
    pub fn cleanup_retry(&self) -> Duration {
        Duration::from_secs(self.cleanup_retry_secs)
    }
}

impl RelayConfig {
    /// Connection timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Keepalive interval, or `None` when disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl ClientConfig {
    /// Retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl TerminalConfig {
    /// Close grace period as a duration.
    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bridgeme")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - BRIDGEME_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - BRIDGEME_KEY_FILE: Override the relay private key file
    /// - BRIDGEME_SHELL: Override the shell binary
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("BRIDGEME_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(key_file) = std::env::var("BRIDGEME_KEY_FILE") {
            if !key_file.is_empty() {
                tracing::info!("Overriding key_file from environment: {}", key_file);
                self.relay.key_file = Some(PathBuf::from(key_file));
            }
        }

        if let Ok(shell) = std::env::var("BRIDGEME_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.terminal.shell = Some(shell);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.port_range_start < 1024 || session.port_range_start >= session.port_range_end {
            return Err(ConfigError::InvalidPortRange(
                session.port_range_start,
                session.port_range_end,
            ));
        }

        if session.max_port_attempts == 0 {
            return Err(ConfigError::InvalidPortAttempts(session.max_port_attempts));
        }

        if session.timeout_minutes == 0 {
            return Err(ConfigError::ZeroDuration("session.timeout_minutes"));
        }
        if session.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("session.cleanup_interval_secs"));
        }
        if session.cleanup_retry_secs == 0 {
            return Err(ConfigError::ZeroDuration("session.cleanup_retry_secs"));
        }
        if self.relay.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("relay.connect_timeout_secs"));
        }

        if self.client.retry_attempts == 0 || self.client.retry_attempts > 100 {
            return Err(ConfigError::InvalidRetryAttempts(self.client.retry_attempts));
        }

        if let Some(key_file) = &self.relay.key_file {
            if !key_file.exists() {
                return Err(ConfigError::InvalidKeyFile(key_file.display().to_string()));
            }
        }

        // Validate shell path exists
        if let Some(shell) = &self.terminal.shell {
            let shell_path = Path::new(shell);

            if shell_path.is_absolute() {
                if !shell_path.exists() {
                    return Err(ConfigError::InvalidShellPath(shell.clone()));
                }
            } else if which::which(shell).is_err() {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
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
