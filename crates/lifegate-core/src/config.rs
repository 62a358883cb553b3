//! Configuration management for lifegate
//!
//! Configuration is read from a TOML file; every section and field has a
//! default so a missing or partial file is valid.
//!
//! ```toml
//! [buffer]
//! initial_capacity = 16
//! pending_warn_threshold = 1024
//!
//! [launch]
//! args = "-purgecaches"
//! uri = "about:home"
//! thread_name = "engine"
//!
//! [launch.profile]
//! mode = "guest"
//! dir = "/data/profiles/guest"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;

/// Upper bound for `buffer.initial_capacity`; larger values are a typo.
const MAX_INITIAL_CAPACITY: usize = 1 << 20;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// Machine-parseable JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deferred-call buffer tuning
    pub buffer: BufferConfig,
    /// Engine launch parameters
    pub launch: LaunchConfig,
    /// Logging configuration
    pub logging: LogConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.buffer.initial_capacity > MAX_INITIAL_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "buffer.initial_capacity must be at most {MAX_INITIAL_CAPACITY}, got {}",
                self.buffer.initial_capacity
            ))
            .into());
        }
        if self.buffer.pending_warn_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "buffer.pending_warn_threshold must be greater than zero".to_string(),
            )
            .into());
        }
        if self.launch.thread_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "launch.thread_name must not be empty".to_string(),
            )
            .into());
        }
        if let ProfileSelection::Default { name } = &self.launch.profile {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "launch.profile.name must not be empty".to_string(),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Deferred-call buffer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Slots reserved up front, and kept after the queue drains
    pub initial_capacity: usize,
    /// Pending entries above which a stalled lifecycle is reported
    pub pending_warn_threshold: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            pending_warn_threshold: 1024,
        }
    }
}

/// Which engine profile the launch should use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProfileSelection {
    /// Named profile, created on demand by the engine
    Default { name: String },
    /// Throwaway guest profile in the given directory
    Guest { dir: PathBuf },
    /// The caller passes its own profile arguments
    Custom,
}

impl Default for ProfileSelection {
    fn default() -> Self {
        Self::Default {
            name: "default".to_string(),
        }
    }
}

/// Engine launch parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Extra engine command-line arguments
    pub args: Option<String>,
    /// Action that started the embedding application
    pub action: Option<String>,
    /// URI to open on startup
    pub uri: Option<String>,
    /// Pause before bootstrap so a debugger can attach
    pub debugging: bool,
    /// Length of the debugger pause in milliseconds
    pub debug_wait_ms: u64,
    /// Name of the engine thread
    pub thread_name: String,
    /// Profile selection
    pub profile: ProfileSelection,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            args: None,
            action: None,
            uri: None,
            debugging: false,
            debug_wait_ms: 5_000,
            thread_name: "engine".to_string(),
            profile: ProfileSelection::default(),
        }
    }
}

impl LaunchConfig {
    /// Debugger pause as a duration
    #[must_use]
    pub const fn debug_wait(&self) -> Duration {
        Duration::from_millis(self.debug_wait_ms)
    }
}
