//! Composition of retry, circuit breaking and error handler dispatch.
//!
//! [`ErrorRecoveryManager::execute`] layers the two policies as
//! `retry(circuit_breaker(operation))`, and stops retrying as soon as the
//! breaker opens. Every failure that escapes is
//! first shown to the caller's custom handler, then routed through
//! [`ErrorRecoveryManager::handle_error`], and finally returned. Errors are
//! never swallowed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, instrument};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
use crate::classify::{Classify, ErrorKind};
use crate::clock::{Clock, SystemClock};
use crate::error::{BoxedError, ConfigResult, RecoveryError, RecoveryResult};
use crate::retry::{RetryConfig, RetryManager};

/// Reacts to an error after recovery gave up.
///
/// Returned errors and panics are logged by the manager and never reach
/// the caller of `execute`.
#[async_trait]
pub trait ErrorHandler<E>: Send + Sync {
    async fn handle(&self, error: &RecoveryError<E>, context: &str) -> Result<(), BoxedError>;
}

/// Routing key for registered handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Kind(ErrorKind),
    /// Fallback used when no handler matches the error's kind
    Default,
}

impl From<ErrorKind> for HandlerKey {
    fn from(kind: ErrorKind) -> Self {
        Self::Kind(kind)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => write!(f, "{kind}"),
            Self::Default => f.write_str("default"),
        }
    }
}

/// Adapter returned by [`handler_fn`]
pub struct HandlerFn<F>(F);

/// Wrap a synchronous closure as an [`ErrorHandler`]
pub fn handler_fn<F>(handler: F) -> HandlerFn<F> {
    HandlerFn(handler)
}

#[async_trait]
impl<E, F> ErrorHandler<E> for HandlerFn<F>
where
    E: Send + Sync + 'static,
    F: Fn(&RecoveryError<E>, &str) -> Result<(), BoxedError> + Send + Sync,
{
    async fn handle(&self, error: &RecoveryError<E>, context: &str) -> Result<(), BoxedError> {
        (self.0)(error, context)
    }
}

type CustomErrorHandler<E> = Arc<dyn Fn(&RecoveryError<E>) + Send + Sync>;

/// Per-call switches for [`ErrorRecoveryManager::execute_with_options`]
pub struct ExecuteOptions<E> {
    pub use_retry: bool,
    pub use_circuit_breaker: bool,
    /// Called with the escaping error before the registered handlers
    pub custom_error_handler: Option<CustomErrorHandler<E>>,
}

impl<E> Default for ExecuteOptions<E> {
    fn default() -> Self {
        Self { use_retry: true, use_circuit_breaker: true, custom_error_handler: None }
    }
}

impl<E> Clone for ExecuteOptions<E> {
    fn clone(&self) -> Self {
        Self {
            use_retry: self.use_retry,
            use_circuit_breaker: self.use_circuit_breaker,
            custom_error_handler: self.custom_error_handler.clone(),
        }
    }
}

impl<E> fmt::Debug for ExecuteOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("use_retry", &self.use_retry)
            .field("use_circuit_breaker", &self.use_circuit_breaker)
            .field("custom_error_handler", &self.custom_error_handler.is_some())
            .finish()
    }
}

impl<E> ExecuteOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_retry(mut self, enabled: bool) -> Self {
        self.use_retry = enabled;
        self
    }

    pub fn use_circuit_breaker(mut self, enabled: bool) -> Self {
        self.use_circuit_breaker = enabled;
        self
    }

    pub fn custom_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RecoveryError<E>) + Send + Sync + 'static,
    {
        self.custom_error_handler = Some(Arc::new(handler));
        self
    }
}

/// One recovery policy: a retry manager, a circuit breaker and a handler
/// registry.
pub struct ErrorRecoveryManager<E, C: Clock = SystemClock> {
    retry: RetryManager<RecoveryError<E>>,
    breaker: CircuitBreaker<C>,
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn ErrorHandler<E>>>>,
}

impl<E, C: Clock> fmt::Debug for ErrorRecoveryManager<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.handlers.read().keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("ErrorRecoveryManager")
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("handlers", &keys)
            .finish()
    }
}

impl<E> ErrorRecoveryManager<E, SystemClock>
where
    E: Classify + Send + Sync + 'static,
{
    /// Build a manager with the default retry policy
    pub fn from_config(
        retry: RetryConfig,
        circuit_breaker: CircuitBreakerConfig,
    ) -> ConfigResult<Self> {
        Ok(Self::new(RetryManager::new(retry)?, CircuitBreaker::new(circuit_breaker)?))
    }
}

impl<E, C> ErrorRecoveryManager<E, C>
where
    E: Classify + Send + Sync + 'static,
    C: Clock,
{
    /// Compose an already configured retry manager and breaker
    pub fn new(retry: RetryManager<RecoveryError<E>>, breaker: CircuitBreaker<C>) -> Self {
        Self { retry, breaker, handlers: RwLock::new(HashMap::new()) }
    }

    pub fn retry_manager(&self) -> &RetryManager<RecoveryError<E>> {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    /// Register `handler` for `key`, replacing any previous one
    pub fn register_error_handler<H>(&self, key: impl Into<HandlerKey>, handler: H)
    where
        H: ErrorHandler<E> + 'static,
    {
        let key = key.into();
        if self.handlers.write().insert(key, Arc::new(handler)).is_some() {
            debug!(%key, "Replaced error handler");
        }
    }

    pub fn has_error_handler(&self, key: impl Into<HandlerKey>) -> bool {
        self.handlers.read().contains_key(&key.into())
    }

    /// Run `operation` with retry and circuit breaking both enabled
    pub async fn execute<F, Fut, T>(&self, operation: F, context: &str) -> RecoveryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_options(operation, context, ExecuteOptions::default()).await
    }

    /// Run `operation` through the layers enabled in `options`.
    ///
    /// Any failure is passed to the custom handler and the registered
    /// handlers, then returned unchanged.
    #[instrument(
        skip(self, operation, options),
        fields(use_retry = options.use_retry, use_circuit_breaker = options.use_circuit_breaker)
    )]
    pub async fn execute_with_options<F, Fut, T>(
        &self,
        operation: F,
        context: &str,
        options: ExecuteOptions<E>,
    ) -> RecoveryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let operation = &operation;
        let breaker = &self.breaker;

        let result = match (options.use_retry, options.use_circuit_breaker) {
            // Once the breaker is open another attempt could only be
            // rejected, so the last operation error is the one returned.
            (true, true) => {
                self.retry
                    .execute_gated(
                        move || breaker.execute(operation, context),
                        context,
                        |_error| breaker.state() != CircuitState::Open,
                    )
                    .await
                    .into_result()
            }
            (true, false) => {
                self.retry
                    .execute(
                        move || async move { operation().await.map_err(RecoveryError::Operation) },
                        context,
                    )
                    .await
            }
            (false, true) => breaker.execute(operation, context).await,
            (false, false) => operation().await.map_err(RecoveryError::Operation),
        };

        if let Err(error) = &result {
            if let Some(custom) = &options.custom_error_handler {
                if std::panic::catch_unwind(AssertUnwindSafe(|| custom(error))).is_err() {
                    error!(context, "Custom error handler panicked");
                }
            }
            self.handle_error(error, context).await;
        }

        result
    }

    /// Log `error` and dispatch it to the handler for its kind, falling
    /// back to the `Default` handler.
    pub async fn handle_error(&self, error: &RecoveryError<E>, context: &str) {
        let kind = error.kind();
        error!(context, %kind, error = %error, "Error in {context}");

        let handler = {
            let handlers = self.handlers.read();
            handlers
                .get(&HandlerKey::Kind(kind))
                .or_else(|| handlers.get(&HandlerKey::Default))
                .cloned()
        };
        let Some(handler) = handler else {
            return;
        };

        match AssertUnwindSafe(handler.handle(error, context)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(handler_error)) => {
                error!(context, %kind, error = %handler_error, "Error handler failed");
            }
            Err(_) => error!(context, %kind, "Error handler panicked"),
        }
    }

    pub fn circuit_breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    pub fn circuit_breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::api::ApiError;
    use crate::clock::MockClock;

    fn manager(max_retries: u32, threshold: u32) -> ErrorRecoveryManager<ApiError, MockClock> {
        let retry = RetryConfig::builder()
            .max_retries(max_retries)
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(4))
            .build()
            .expect("valid retry config");
        let breaker = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .build()
            .expect("valid breaker config");
        ErrorRecoveryManager::new(
            RetryManager::new(retry).expect("valid retry manager"),
            CircuitBreaker::with_clock(breaker, MockClock::new()).expect("valid breaker"),
        )
    }

    fn counting_handler(counter: &Arc<AtomicU32>) -> impl ErrorHandler<ApiError> + 'static {
        let counter = Arc::clone(counter);
        handler_fn(move |_error: &RecoveryError<ApiError>, _context: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_execute_returns_success_value() {
        let manager = manager(3, 5);
        let value = manager.execute(|| async { Ok::<_, ApiError>(42) }, "rbi/score").await;
        assert_eq!(value.ok(), Some(42));
        assert_eq!(manager.circuit_breaker_state(), CircuitState::Closed);
    }

    /// Validates the layered call retries through the breaker and returns
    /// the operation's own error.
    ///
    /// Assertions:
    /// - Confirms `max_retries + 1` invocations.
    /// - Ensures the error is the original `ApiError`, not a circuit-open.
    /// - Confirms the breaker counted every failed attempt.
    #[tokio::test]
    async fn test_execute_retries_through_breaker() {
        let manager = manager(2, 10);
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), ApiError> = manager
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ApiError::http(503, "Service Unavailable")) }
                },
                "equipment/list",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RecoveryError::Operation(error)) => assert_eq!(error.status(), Some(503)),
            other => panic!("expected operation error, got {other:?}"),
        }
        assert_eq!(manager.circuit_breaker_metrics().failure_count, 3);
    }

    /// Validates a breaker that opens mid-retry ends the call with the
    /// operation's own error.
    ///
    /// Assertions:
    /// - Confirms one invocation and no retry hook call.
    /// - Ensures the returned error is the 503, not a circuit-open.
    /// - Confirms the breaker rejected nothing.
    #[tokio::test]
    async fn test_breaker_opening_mid_retry_keeps_operation_error() {
        let retries = Arc::new(AtomicU32::new(0));
        let retries_hook = Arc::clone(&retries);
        let retry = RetryManager::new(
            RetryConfig::builder()
                .max_retries(3)
                .base_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(4))
                .build()
                .expect("valid retry config"),
        )
        .expect("valid retry manager")
        .on_retry(move |_error: &RecoveryError<ApiError>, _attempt| {
            retries_hook.fetch_add(1, Ordering::SeqCst);
        });
        let breaker = CircuitBreaker::with_clock(
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config"),
            MockClock::new(),
        )
        .expect("valid breaker");
        let manager = ErrorRecoveryManager::new(retry, breaker);
        let calls = AtomicU32::new(0);

        let result: RecoveryResult<(), ApiError> = manager
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ApiError::http(503, "Service Unavailable")) }
                },
                "psv/list",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
        match result {
            Err(RecoveryError::Operation(error)) => assert_eq!(error.status(), Some(503)),
            other => panic!("expected the 503, got {other:?}"),
        }
        assert_eq!(manager.circuit_breaker_state(), CircuitState::Open);
        assert_eq!(manager.circuit_breaker_metrics().rejected_calls, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_rejection_is_not_retried() {
        let manager = manager(5, 1);
        let calls = AtomicU32::new(0);
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApiError::type_error("fetch failed")) }
        };

        assert!(matches!(manager.execute(failing, "psv/list").await, Err(RecoveryError::Operation(_))));
        let rejected = manager.execute(failing, "psv/list").await;

        assert!(rejected.as_ref().is_err_and(RecoveryError::is_circuit_open));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.circuit_breaker_metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_execute_without_layers_runs_once() {
        let manager = manager(3, 1);
        let calls = AtomicU32::new(0);
        let options = ExecuteOptions::new().use_retry(false).use_circuit_breaker(false);

        let result: RecoveryResult<(), ApiError> = manager
            .execute_with_options(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ApiError::network("offline")) }
                },
                "attendance/sync",
                options,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.circuit_breaker_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retry_only_bypasses_breaker() {
        let manager = manager(2, 1);
        let calls = AtomicU32::new(0);
        let options = ExecuteOptions::new().use_circuit_breaker(false);

        let result: RecoveryResult<(), ApiError> = manager
            .execute_with_options(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ApiError::network("offline")) }
                },
                "attendance/sync",
                options,
            )
            .await;

        assert!(matches!(result, Err(RecoveryError::Operation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.circuit_breaker_state(), CircuitState::Closed);
    }

    /// Validates handler dispatch by error kind with a default fallback.
    ///
    /// Assertions:
    /// - Confirms a timeout reaches the timeout handler only.
    /// - Confirms a client error falls back to the default handler.
    /// - Confirms the custom handler runs for every escaping error.
    #[tokio::test]
    async fn test_handler_dispatch_and_fallback() {
        let manager = manager(0, 10);
        let timeouts = Arc::new(AtomicU32::new(0));
        let defaults = Arc::new(AtomicU32::new(0));
        let custom = Arc::new(AtomicU32::new(0));
        manager.register_error_handler(ErrorKind::Timeout, counting_handler(&timeouts));
        manager.register_error_handler(HandlerKey::Default, counting_handler(&defaults));

        for error in [ApiError::timeout("Request timeout"), ApiError::http(404, "Not Found")] {
            let custom = Arc::clone(&custom);
            let options = ExecuteOptions::new().custom_error_handler(move |_error| {
                custom.fetch_add(1, Ordering::SeqCst);
            });
            let result: RecoveryResult<(), ApiError> = manager
                .execute_with_options(
                    move || {
                        let error = error.clone();
                        async move { Err(error) }
                    },
                    "reports/daily",
                    options,
                )
                .await;
            assert!(result.is_err());
        }

        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(defaults.load(Ordering::SeqCst), 1);
        assert_eq!(custom.load(Ordering::SeqCst), 2);
    }

    struct SlowRecorder {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl ErrorHandler<ApiError> for SlowRecorder {
        async fn handle(
            &self,
            _error: &RecoveryError<ApiError>,
            _context: &str,
        ) -> Result<(), BoxedError> {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().push("handler");
            Ok(())
        }
    }

    /// Validates an async handler is awaited before `execute` returns.
    #[tokio::test]
    async fn test_async_handler_completes_before_execute_returns() {
        let manager = manager(0, 10);
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register_error_handler(ErrorKind::Network, SlowRecorder { log: Arc::clone(&log) });

        let result: RecoveryResult<(), ApiError> =
            manager.execute(|| async { Err(ApiError::network("offline")) }, "sync").await;

        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["handler"]);
    }

    /// Validates the order of work on an escaping error.
    ///
    /// Assertions:
    /// - Confirms the custom handler runs first, then the registered
    ///   handler, and only then does `execute` return.
    #[tokio::test]
    async fn test_escaping_error_runs_custom_then_registered_handler() {
        let manager = manager(0, 10);
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register_error_handler(HandlerKey::Default, SlowRecorder { log: Arc::clone(&log) });

        let custom_log = Arc::clone(&log);
        let options = ExecuteOptions::new()
            .custom_error_handler(move |_error| custom_log.lock().push("custom"));
        let result: RecoveryResult<(), ApiError> = manager
            .execute_with_options(|| async { Err(ApiError::message("disk full")) }, "reports", options)
            .await;
        log.lock().push("returned");

        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["custom", "handler", "returned"]);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let manager = manager(0, 10);
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        manager.register_error_handler(ErrorKind::Network, counting_handler(&first));
        manager.register_error_handler(ErrorKind::Network, counting_handler(&second));

        let error = RecoveryError::Operation(ApiError::network("offline"));
        manager.handle_error(&error, "sync").await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(manager.has_error_handler(ErrorKind::Network));
        assert!(!manager.has_error_handler(HandlerKey::Default));
    }

    /// Validates failing and panicking handlers never escape.
    ///
    /// Assertions:
    /// - Ensures `execute` still returns the operation error.
    /// - Ensures a panicking handler does not unwind into the caller.
    #[tokio::test]
    async fn test_handler_failures_are_isolated() {
        let manager = manager(0, 10);
        manager.register_error_handler(
            ErrorKind::Server,
            handler_fn(|_error: &RecoveryError<ApiError>, _context: &str| {
                Err::<(), BoxedError>("handler exploded".into())
            }),
        );
        manager.register_error_handler(
            HandlerKey::Default,
            handler_fn(|_error: &RecoveryError<ApiError>, _context: &str| -> Result<(), BoxedError> {
                panic!("handler panicked")
            }),
        );

        let server: RecoveryResult<(), ApiError> = manager
            .execute(|| async { Err(ApiError::http(500, "Internal Server Error")) }, "a")
            .await;
        assert!(matches!(server, Err(RecoveryError::Operation(ApiError::Http { status: 500, .. }))));

        let unknown: RecoveryResult<(), ApiError> =
            manager.execute(|| async { Err(ApiError::message("disk full")) }, "b").await;
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn test_circuit_open_routes_to_circuit_open_handler() {
        let manager = manager(0, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = Arc::clone(&seen);
        manager.register_error_handler(
            ErrorKind::CircuitOpen,
            handler_fn(move |error: &RecoveryError<ApiError>, context: &str| {
                seen_handler.lock().push((error.to_string(), context.to_string()));
                Ok(())
            }),
        );

        let _ = manager.execute(|| async { Err::<(), _>(ApiError::network("offline")) }, "psv").await;
        let _ = manager.execute(|| async { Ok::<_, ApiError>(()) }, "psv").await;

        assert_eq!(
            *seen.lock(),
            vec![("Circuit breaker is open for psv".to_string(), "psv".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reset_circuit_breaker_delegates() {
        let manager = manager(0, 1);
        let _ = manager.execute(|| async { Err::<(), _>(ApiError::network("offline")) }, "x").await;
        assert_eq!(manager.circuit_breaker_state(), CircuitState::Open);

        manager.reset_circuit_breaker();
        assert_eq!(manager.circuit_breaker_state(), CircuitState::Closed);
        assert_eq!(manager.circuit_breaker_metrics().failure_count, 0);
    }
}
