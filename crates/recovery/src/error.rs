//! Error types for the recovery layer.
//!
//! Three kinds of failure move through this crate:
//!
//! | Origin | Type | Reaches the caller? |
//! |--------|------|---------------------|
//! | The wrapped operation | [`RecoveryError::Operation`] | yes, unmodified |
//! | A fail-fast open circuit | [`RecoveryError::CircuitOpen`] | yes |
//! | A registered error handler | [`BoxedError`] | no, logged only |
//!
//! Configuration problems are reported separately through [`ConfigError`]
//! when a policy is built, never while an operation runs.

use std::path::PathBuf;

use thiserror::Error;

/// Label used when a caller does not name the operation
pub const DEFAULT_CONTEXT: &str = "operation";

/// Failure of a call made through a recovery component.
#[derive(Debug, Error)]
pub enum RecoveryError<E> {
    /// The breaker rejected the call without invoking the operation
    #[error("Circuit breaker is open for {context}")]
    CircuitOpen { context: String },

    /// The operation itself failed; displayed exactly as the inner error
    #[error(transparent)]
    Operation(E),
}

impl<E> RecoveryError<E> {
    pub(crate) fn circuit_open(context: &str) -> Self {
        let context = if context.is_empty() { DEFAULT_CONTEXT } else { context };
        Self::CircuitOpen { context: context.to_string() }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Borrow the operation's own error, if that is what failed
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Take the operation's own error, if that is what failed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::CircuitOpen { .. } => None,
        }
    }
}

/// Error raised by an error handler; isolated inside `handle_error`
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a call made through a recovery component
pub type RecoveryResult<T, E> = Result<T, RecoveryError<E>>;

/// Problems building or loading a recovery policy.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to read configuration file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} configuration: {message}")]
    Parse { format: &'static str, message: String },

    #[error("Unsupported configuration file extension: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Invalid value {value:?} for environment variable {variable}")]
    Env { variable: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
