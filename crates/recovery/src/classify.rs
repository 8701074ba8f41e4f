//! Error classification heuristics.
//!
//! Retry eligibility and handler routing are decided from an error's
//! rendered message and its [`Classify::name`], using deliberately coarse
//! substring checks. The looseness is part of the contract: a message such
//! as `"HTTP 415"` counts as both a client and a server error, and matching
//! is case-sensitive.

use std::fmt;

use crate::error::RecoveryError;

/// Name reported for fail-fast circuit breaker rejections
pub const CIRCUIT_OPEN_ERROR_NAME: &str = "CircuitOpenError";

/// An error that can be classified for retry and handler dispatch.
///
/// `name` is a short error type label (`"TypeError"`, `"TimeoutError"`,
/// ...). Types that have no meaningful name keep the default `"Error"`.
pub trait Classify: std::error::Error {
    fn name(&self) -> &str {
        "Error"
    }

    /// Coarse kind used to pick an error handler
    fn kind(&self) -> ErrorKind {
        ErrorKind::from_heuristics(self)
    }
}

/// True for fetch, network and connection failures.
pub fn is_network_error<E: Classify + ?Sized>(error: &E) -> bool {
    let message = error.to_string();
    message.contains("fetch")
        || message.contains("network")
        || message.contains("connection")
        || matches!(error.name(), "NetworkError" | "TypeError")
}

pub fn is_timeout_error<E: Classify + ?Sized>(error: &E) -> bool {
    error.to_string().contains("timeout") || error.name() == "TimeoutError"
}

/// Heuristic 5xx match: the message mentions `HTTP` and contains a `5`.
pub fn is_server_error<E: Classify + ?Sized>(error: &E) -> bool {
    let message = error.to_string();
    message.contains('5') && message.contains("HTTP")
}

/// Heuristic 4xx match: the message mentions `HTTP` and contains a `4`.
pub fn is_client_error<E: Classify + ?Sized>(error: &E) -> bool {
    let message = error.to_string();
    message.contains('4') && message.contains("HTTP")
}

/// Tag computed once per error and used for exhaustive handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Server,
    Client,
    CircuitOpen,
    Unknown,
}

impl ErrorKind {
    /// Classify an error purely from its message and name.
    ///
    /// Precedence is timeout, network, server, client: a
    /// `"connection timeout"` is a timeout, not a network error.
    pub fn from_heuristics<E: Classify + ?Sized>(error: &E) -> Self {
        if error.name() == CIRCUIT_OPEN_ERROR_NAME {
            Self::CircuitOpen
        } else if is_timeout_error(error) {
            Self::Timeout
        } else if is_network_error(error) {
            Self::Network
        } else if is_server_error(error) {
            Self::Server
        } else if is_client_error(error) {
            Self::Client
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Client => "client",
            Self::CircuitOpen => "circuit-open",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<E> Classify for RecoveryError<E>
where
    E: Classify + 'static,
{
    fn name(&self) -> &str {
        match self {
            Self::CircuitOpen { .. } => CIRCUIT_OPEN_ERROR_NAME,
            Self::Operation(error) => error.name(),
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Operation(error) => error.kind(),
        }
    }
}

impl Classify for std::io::Error {
    fn name(&self) -> &str {
        use std::io::ErrorKind as Io;

        match self.kind() {
            Io::TimedOut => "TimeoutError",
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe => "NetworkError",
            _ => "Error",
        }
    }
}
