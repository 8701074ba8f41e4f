//! The default recovery policy used by the Inspectra client.
//!
//! Wires a manager that retries only network and server failures, narrates
//! retries and breaker transitions through a [`Notifier`] when
//! notifications are enabled, and registers handlers for network errors,
//! timeouts and everything else.

use std::sync::Arc;

use tracing::{error, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::classify::{is_network_error, is_server_error, Classify, ErrorKind};
use crate::clock::{Clock, SystemClock};
use crate::config::RecoveryOptions;
use crate::constants::DEFAULT_RETRY_ATTEMPT_CAP;
use crate::error::{ConfigResult, RecoveryError};
use crate::manager::{handler_fn, ErrorRecoveryManager, HandlerKey};
use crate::notify::{Notification, Notifier};
use crate::retry::{RetryConfig, RetryManager};

/// Retry condition of the default policy.
///
/// Only network and server failures are retried, and only while fewer than
/// three attempts have failed, whatever `max_retries` says.
pub fn default_retry_condition<E>(error: &E, attempt: u32, _config: &RetryConfig) -> bool
where
    E: Classify + ?Sized,
{
    attempt < DEFAULT_RETRY_ATTEMPT_CAP && (is_network_error(error) || is_server_error(error))
}

/// Build the default manager.
pub fn create_error_recovery_manager<E>(
    options: RecoveryOptions,
    notifier: Arc<dyn Notifier>,
) -> ConfigResult<ErrorRecoveryManager<E>>
where
    E: Classify + Send + Sync + 'static,
{
    create_error_recovery_manager_with_clock(options, notifier, SystemClock)
}

/// Like [`create_error_recovery_manager`], with the breaker reading time
/// from `clock`.
pub fn create_error_recovery_manager_with_clock<E, C>(
    options: RecoveryOptions,
    notifier: Arc<dyn Notifier>,
    clock: C,
) -> ConfigResult<ErrorRecoveryManager<E, C>>
where
    E: Classify + Send + Sync + 'static,
    C: Clock,
{
    options.validate()?;
    let notify = options.enable_notifications;
    let max_retries = options.retry.max_retries;

    let mut retry = RetryManager::new(options.retry)?
        .with_retry_condition(|error: &RecoveryError<E>, attempt, config: &RetryConfig| {
            default_retry_condition(error, attempt, config)
        });
    let mut breaker = CircuitBreaker::with_clock(options.circuit_breaker, clock)?;

    if notify {
        let on_retry = Arc::clone(&notifier);
        let on_exhausted = Arc::clone(&notifier);
        let on_transition = Arc::clone(&notifier);

        retry = retry
            .on_retry(move |_error: &RecoveryError<E>, attempt| {
                on_retry.notify(Notification::info(
                    "Connection issue",
                    format!("Retrying ({attempt}/{max_retries})"),
                ));
            })
            .on_max_retries_reached(move |_error: &RecoveryError<E>| {
                on_exhausted.notify(Notification::error(
                    "Request failed",
                    "Failed after multiple attempts. Please try again later.",
                ));
            });
        breaker = breaker.on_state_change(move |state| {
            on_transition.notify(state_notification(state));
        });
    }

    let manager = ErrorRecoveryManager::new(retry, breaker);
    register_default_handlers(&manager, notifier, notify);
    Ok(manager)
}

fn state_notification(state: CircuitState) -> Notification {
    match state {
        CircuitState::Open => Notification::error(
            "Service unavailable",
            "Service temporarily unavailable. Requests are paused.",
        ),
        CircuitState::HalfOpen => {
            Notification::info("Reconnecting", "Attempting to restore connection to the service")
        }
        CircuitState::Closed => Notification::success("Connected", "Service restored"),
    }
}

fn register_default_handlers<E, C>(
    manager: &ErrorRecoveryManager<E, C>,
    notifier: Arc<dyn Notifier>,
    notify: bool,
) where
    E: Classify + Send + Sync + 'static,
    C: Clock,
{
    let network_notifier = Arc::clone(&notifier);
    manager.register_error_handler(
        ErrorKind::Network,
        handler_fn(move |error: &RecoveryError<E>, context: &str| {
            warn!(context, error = %error, "Network error");
            if notify {
                network_notifier.notify(Notification::error(
                    "Network error",
                    "Please check your internet connection",
                ));
            }
            Ok(())
        }),
    );

    manager.register_error_handler(
        ErrorKind::Timeout,
        handler_fn(move |error: &RecoveryError<E>, context: &str| {
            warn!(context, error = %error, "Request timed out");
            if notify {
                notifier.notify(Notification::warning(
                    "Request timeout",
                    "The request took too long. Please try again.",
                ));
            }
            Ok(())
        }),
    );

    manager.register_error_handler(
        HandlerKey::Default,
        handler_fn(|error: &RecoveryError<E>, context: &str| {
            error!(context, kind = %error.kind(), error = %error, "Unhandled error");
            Ok(())
        }),
    );
}
