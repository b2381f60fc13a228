//! Error taxonomy.
//!
//! [`DripError`] covers everything a caller of the registry or the gateway can
//! see. [`SideEffectError`] is the executor's report about a failed send; it is
//! logged and never aborts a subscription.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, DripError>;

#[derive(Debug, Error)]
pub enum DripError {
    /// A subscription for this id is still Active or Cancelling.
    #[error("subscription already active for '{0}'")]
    Conflict(String),

    #[error("no subscription found for '{0}'")]
    NotFound(String),

    #[error("invalid subscriber id '{0}'")]
    InvalidSubscriber(String),

    /// The registry is draining and no longer accepts new subscriptions.
    #[error("registry is shutting down")]
    ShuttingDown,

    /// Durable storage is unavailable or rejected a write.
    #[error("storage error: {0}")]
    Storage(String),

    /// A previous storage fault stopped this subscriber's machine.
    #[error("subscription '{0}' is halted after a storage fault")]
    Halted(String),

    #[error("corrupt log for '{subscriber}': {reason}")]
    CorruptLog { subscriber: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DripError {
    pub fn corrupt_log(subscriber: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptLog {
            subscriber: subscriber.into(),
            reason: reason.into(),
        }
    }

    /// Storage-class errors halt the affected subscriber.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Serialization(_) | Self::Io(_))
    }
}

/// Why a side effect did not happen.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SideEffectError {
    /// Every attempt failed with a retriable error.
    #[error("gave up after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    /// The notifier refused the message outright.
    #[error("terminal failure: {0}")]
    Terminal(String),
}
