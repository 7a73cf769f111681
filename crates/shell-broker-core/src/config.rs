//! Broker configuration.
//!
//! Loaded from TOML; every section falls back to its defaults. The default
//! path is `~/.config/shell-broker/config.toml`.

use std::{
    collections::HashMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Geometry;

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },
    #[error("sweep_interval_secs ({interval}) must not exceed idle_timeout_secs ({timeout})")]
    SweepSlowerThanTimeout { interval: u64, timeout: u64 },
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
    pub auth: AuthConfig,
    pub backend: BackendConfig,
}

/// HTTP listener and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Session lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity after which a connected session is torn down.
    pub idle_timeout_secs: u64,
    /// How often the idle sweeper scans the registry.
    pub sweep_interval_secs: u64,
    /// Upper bound on the remote handshake plus shell open.
    pub connect_timeout_secs: u64,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Reject a second live session for the same authenticated caller.
    pub single_session_per_owner: bool,
    /// `TERM` requested for the remote pty.
    pub term: String,
}

/// What the audit trail records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Keep sanitized input text, not only its length.
    pub record_input_content: bool,
    /// Characters of input content kept per record.
    pub content_limit: usize,
    pub flag_dangerous_commands: bool,
    /// Records buffered before new ones are dropped.
    pub queue_capacity: usize,
}

/// Caller authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Token value to owner id. Empty disables authentication.
    pub tokens: HashMap<String, String>,
    pub cookie_name: String,
}

/// Remote shell backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process echo shell for demos and local development.
    #[default]
    Simulated,
    /// SSH via russh (requires the `russh` feature).
    Russh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            connect_timeout_secs: 10,
            default_cols: 80,
            default_rows: 24,
            max_sessions: 100,
            single_session_per_owner: false,
            term: "xterm-256color".to_string(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Initial pty size when the connect request carries none.
    #[must_use]
    pub fn default_geometry(&self) -> Geometry {
        Geometry::new(self.default_cols, self.default_rows).unwrap_or_default()
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            record_input_content: false,
            content_limit: 100,
            flag_dangerous_commands: true,
            queue_capacity: 1024,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            cookie_name: "broker_session".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("shell-broker").join("config.toml"))
    }

    /// Load and validate a config file. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.server.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let session = &self.session;
        for (field, value) in [
            ("idle_timeout_secs", session.idle_timeout_secs),
            ("sweep_interval_secs", session.sweep_interval_secs),
            ("connect_timeout_secs", session.connect_timeout_secs),
            ("default_cols", u64::from(session.default_cols)),
            ("default_rows", u64::from(session.default_rows)),
            ("max_sessions", session.max_sessions as u64),
            ("queue_capacity", self.audit.queue_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if session.sweep_interval_secs > session.idle_timeout_secs {
            return Err(ConfigError::SweepSlowerThanTimeout {
                interval: session.sweep_interval_secs,
                timeout: session.idle_timeout_secs,
            });
        }

        Ok(())
    }

    /// Whether callers must present a token.
    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        !self.auth.tokens.is_empty()
    }
}
