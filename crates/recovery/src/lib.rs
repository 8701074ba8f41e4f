//! Error recovery for Inspectra backend calls.
//!
//! Wraps fallible async operations (typically HTTP requests to the
//! Inspectra API) with:
//! - **Retry**: bounded retries with capped exponential backoff
//!   ([`RetryManager`])
//! - **Circuit Breaker**: fail-fast after repeated failures, with a lazy
//!   half-open probe ([`CircuitBreaker`])
//! - **Error Handlers**: per-kind handlers run after recovery gives up
//!   ([`ErrorRecoveryManager`])
//!
//! [`create_error_recovery_manager`] builds the default policy, and
//! [`error_recovery_manager`] returns a lazily created process-wide
//! instance.
//!
//! ## Example
//!
//! ```rust,no_run
//! use inspectra_recovery::{error_recovery_manager, ApiError};
//!
//! # async fn example() {
//! let manager = error_recovery_manager();
//! let result = manager
//!     .execute(|| async { Err::<(), _>(ApiError::http(503, "Service Unavailable")) }, "equipment/list")
//!     .await;
//! assert!(result.is_err());
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod api;
pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod factory;
pub mod global;
pub mod manager;
pub mod notify;
pub mod retry;
mod serde_util;

pub use api::ApiError;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use classify::{
    is_client_error, is_network_error, is_server_error, is_timeout_error, Classify, ErrorKind,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::RecoveryOptions;
pub use error::{BoxedError, ConfigError, ConfigResult, RecoveryError, RecoveryResult};
pub use factory::{
    create_error_recovery_manager, create_error_recovery_manager_with_clock,
    default_retry_condition,
};
pub use global::{
    error_recovery_manager, init_error_recovery_manager, reset_error_recovery_manager,
    SharedRecoveryManager,
};
pub use manager::{
    handler_fn, ErrorHandler, ErrorRecoveryManager, ExecuteOptions, HandlerFn, HandlerKey,
};
pub use notify::{NoopNotifier, Notification, NotificationLevel, Notifier, TracingNotifier};
pub use retry::{policies, RetryConfig, RetryConfigBuilder, RetryManager, RetryOutcome, RetryPolicy};
pub use serde_util::duration_millis;
