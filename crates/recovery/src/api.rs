//! Errors produced by backend API calls.
//!
//! [`ApiError`] models how a request to the Inspectra backend can fail.
//! Each variant reports a stable [`Classify::name`] (`TypeError`,
//! `HttpError`, ...) and message, which is what the heuristics in
//! [`crate::classify`] key on.

use thiserror::Error;

use crate::classify::Classify;

/// Failure of a backend API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The request never produced a response
    #[error("{message}")]
    Type { message: String },

    #[error("{message}")]
    Network { message: String },

    #[error("{message}")]
    Timeout { message: String },

    /// The backend answered with a non-success status
    #[error("HTTP {status}: {status_text}")]
    Http { status: u16, status_text: String },

    /// Any other named failure
    #[error("{message}")]
    Other { name: String, message: String },
}

impl ApiError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type { message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into() }
    }

    pub fn http(status: u16, status_text: impl Into<String>) -> Self {
        Self::Http { status, status_text: status_text.into() }
    }

    /// A plain `Error` with the given message
    pub fn message(message: impl Into<String>) -> Self {
        Self::Other { name: "Error".to_string(), message: message.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Classify for ApiError {
    fn name(&self) -> &str {
        match self {
            Self::Type { .. } => "TypeError",
            Self::Network { .. } => "NetworkError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Http { .. } => "HttpError",
            Self::Other { name, .. } => name.as_str(),
        }
    }
}

#[cfg(feature = "http")]
mod http {
    use super::ApiError;

    impl From<reqwest::Error> for ApiError {
        fn from(error: reqwest::Error) -> Self {
            if error.is_timeout() {
                Self::timeout(format!("Request timeout: {error}"))
            } else if error.is_connect() {
                Self::network(format!("connection failed: {error}"))
            } else if let Some(status) = error.status() {
                Self::http(status.as_u16(), status.canonical_reason().unwrap_or_default())
            } else {
                Self::type_error(format!("fetch failed: {error}"))
            }
        }
    }

    impl ApiError {
        /// Pass a successful response through, or turn its status into
        /// [`ApiError::Http`].
        pub fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Self> {
            let status = response.status();
            if status.is_success() {
                Ok(response)
            } else {
                Err(Self::http(status.as_u16(), status.canonical_reason().unwrap_or_default()))
            }
        }
    }
}
