//! Error types for lifegate-core

use std::path::PathBuf;

use thiserror::Error;

use crate::state::LifecycleState;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of invoking a capability operation.
///
/// Capability operations never produce a value: a buffered call has no
/// caller left to receive one.
pub type CallResult = std::result::Result<(), CallRejected>;

/// A capability operation refused the call it was given.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct CallRejected {
    reason: String,
}

impl CallRejected {
    /// Create a rejection with a human-readable reason
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Reason given by the rejecting operation
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Main error type for lifegate-core
#[derive(Error, Debug)]
pub enum Error {
    /// Lifecycle misuse (wrong thread, regression, double install)
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// A buffered call was rejected by its target when finally delivered.
    /// Buffered calls are not retried.
    #[error("buffered call `{operation}` was rejected on delivery: {source}")]
    Delivery {
        operation: &'static str,
        #[source]
        source: CallRejected,
    },

    /// A buffered call could not be invoked at all (the stored call panicked)
    #[error("buffered call `{operation}` could not be invoked: {message}")]
    Invocation {
        operation: &'static str,
        message: String,
    },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Engine launch errors
    #[error("Launch error: {0}")]
    Launch(String),
}

impl Error {
    /// Whether this error came out of a flush pass rather than a misuse of the API
    #[must_use]
    pub const fn is_delivery_fault(&self) -> bool {
        matches!(self, Self::Delivery { .. } | Self::Invocation { .. })
    }
}

/// Lifecycle state machine misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("state may only be advanced by the lifecycle owner thread ({owner}), not {caller}")]
    NotOwner { owner: String, caller: String },

    #[error("lifecycle owner is already bound to {owner}")]
    OwnerAlreadyBound { owner: String },

    #[error("lifecycle cannot move backwards from {from} to {to}")]
    Regression {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("no event sink installed; pending events cannot be accepted")]
    EventSinkMissing,

    #[error("an event sink is already installed")]
    EventSinkAlreadyInstalled,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    ValidationError(String),
}
