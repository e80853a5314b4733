//! Error model shared by every throttling layer.

use thiserror::Error;

/// Result type for shared-store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type used by strategies, the registry and the throttling service.
pub type ThrottleResult<T> = Result<T, ThrottleError>;

/// Failure talking to the shared key-value store.
///
/// Store errors are never swallowed by the throttling layer: the caller (the
/// fetch loop) applies its own retry/backoff.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    /// A server-side script failed for a reason other than a missing handle.
    #[error("store script error: {0}")]
    Script(String),

    /// An in-process store lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

/// Throttling-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An argument-derived limit, period or key suffix function failed.
    ///
    /// Surfaced rather than swallowed: a broken key function corrupts the
    /// fingerprint space.
    #[error("key function failed for {strategy}: {message}")]
    KeyFunction { strategy: String, message: String },

    /// Alias or reset target that was never registered.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl ThrottleError {
    pub fn key_function(strategy: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::KeyFunction {
            strategy: strategy.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// A raw job message could not be interpreted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed job payload: {0}")]
    Malformed(String),

    #[error("job payload is missing field `{0}`")]
    MissingField(&'static str),

    #[error("job payload field `{field}` has the wrong type (expected {expected})")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}
