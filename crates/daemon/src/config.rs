//! Configuration management for the Shellmux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellmux/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{
    RegistrySettings, SessionOptions, DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_SESSIONS,
};
use crate::session::process::{DEFAULT_SHELL, DEFAULT_TERM};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 127.0.0.1:8765, got {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_frame_bytes must be between 1 KiB and 64 MiB, got {0}")]
    InvalidMaxFrameBytes(usize),

    #[error("shell does not exist: {0}")]
    InvalidShellPath(String),

    #[error("working_dir does not exist: {0}")]
    InvalidWorkingDir(String),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("history_capacity must be between 1 and 100000, got {0}")]
    InvalidHistoryCapacity(usize),

    #[error("poll_interval_ms must be between 10 and 10000, got {0}")]
    InvalidPollInterval(u64),

    #[error("stop_grace_ms must be at most 60000, got {0}")]
    InvalidStopGrace(u64),

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default address the gateway listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";

/// Main configuration structure for the Shellmux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Gateway and logging configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// Gateway and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket gateway binds to.
    pub listen_addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,

    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used to interpret session commands (`<shell> -c <command>`).
    pub shell: String,

    /// Value exported as `TERM`.
    pub term: String,

    /// Working directory for sessions that do not name one.
    pub working_dir: Option<PathBuf>,

    /// Terminal width used by the CLI when none is given.
    pub default_cols: u16,

    /// Terminal height used by the CLI when none is given.
    pub default_rows: u16,

    /// Output frames retained per session for late joiners.
    pub history_capacity: usize,

    /// How often a session checks whether its process has exited.
    pub poll_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a session.
    pub stop_grace_ms: u64,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            log_level: "info".to_string(),
            log_file: None,
            max_frame_bytes: protocol::MAX_FRAME_SIZE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            term: DEFAULT_TERM.to_string(),
            working_dir: None,
            default_cols: protocol::DEFAULT_COLS,
            default_rows: protocol::DEFAULT_ROWS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            poll_interval_ms: 100,
            stop_grace_ms: 2000,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ServerConfig {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.listen_addr.clone()))
    }
}

impl SessionConfig {
    /// Per-session tunables.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            history_capacity: self.history_capacity,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    /// Registry-wide settings.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            session: self.session_options(),
            working_dir: self.working_dir.clone(),
            max_sessions: self.max_sessions,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLMUX_LISTEN_ADDR: Override the gateway listen address
    /// - SHELLMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SHELLMUX_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("SHELLMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.listen_addr()?;

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if !(1024..=64 * 1024 * 1024).contains(&self.server.max_frame_bytes) {
            return Err(ConfigError::InvalidMaxFrameBytes(self.server.max_frame_bytes));
        }

        let session = &self.session;

        // Absolute shells must exist; bare names are looked up on PATH
        let shell_path = Path::new(&session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.shell.clone()));
        }

        if let Some(dir) = &session.working_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidWorkingDir(dir.display().to_string()));
            }
        }

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: session.default_cols,
                rows: session.default_rows,
            });
        }

        if !(1..=100_000).contains(&session.history_capacity) {
            return Err(ConfigError::InvalidHistoryCapacity(session.history_capacity));
        }

        if !(10..=10_000).contains(&session.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(session.poll_interval_ms));
        }

        if session.stop_grace_ms > 60_000 {
            return Err(ConfigError::InvalidStopGrace(session.stop_grace_ms));
        }

        if !(1..=1000).contains(&session.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
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
