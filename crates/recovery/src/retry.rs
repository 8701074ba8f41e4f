//! Bounded retry with capped exponential backoff.
//!
//! [`RetryManager`] runs an async operation, and on failure waits
//! `min(base_delay × backoff_factor^(attempt−1), max_delay)` before trying
//! again, for at most `max_retries` retries. Whether a particular failure
//! is retried at all is decided by a [`RetryPolicy`], which receives the
//! full [`RetryConfig`] so it never needs to capture it.
//!
//! Retries of one `execute` call are strictly sequential. The wait is a
//! `tokio::time::sleep`, so other tasks keep running meanwhile.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    MAX_BACKOFF_EXPONENT,
};
use crate::error::{ConfigError, ConfigResult};
use crate::serde_util::duration_millis;

/// Retry limits and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single delay
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(ConfigError::invalid(format!(
                "backoff_factor must be a finite number greater than 1, got {}",
                self.backoff_factor
            )));
        }

        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }

        Ok(())
    }

    /// Delay to wait before retry number `attempt` (1-based).
    ///
    /// The first retry waits exactly `base_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let base_nanos = self.base_delay.as_nanos() as f64;
        let max_nanos = self.max_delay.as_nanos() as f64;
        let delay_nanos = (base_nanos * self.backoff_factor.powi(exponent)).min(max_nanos);
        Duration::from_nanos(delay_nanos.round() as u64).min(self.max_delay)
    }
}

/// Fluent builder for [`RetryConfig`].
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Decides whether a failed attempt should be retried.
///
/// `attempt` is the number of failed attempts so far (1 after the first
/// failure). The manager separately stops once `attempt > max_retries`.
pub trait RetryPolicy<E>: Send + Sync {
    fn should_retry(&self, error: &E, attempt: u32, config: &RetryConfig) -> bool;
}

/// Ready-made retry policies.
pub mod policies {
    use super::*;

    /// Retry every failure until `max_retries` is reached (the default)
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UntilMaxRetries;

    impl<E> RetryPolicy<E> for UntilMaxRetries {
        fn should_retry(&self, _error: &E, attempt: u32, config: &RetryConfig) -> bool {
            attempt <= config.max_retries
        }
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32, _config: &RetryConfig) -> bool {
            true
        }
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32, _config: &RetryConfig) -> bool {
            false
        }
    }

    /// Policy backed by a closure
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F> fmt::Debug for PredicateRetry<F> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("PredicateRetry")
        }
    }

    impl<E, F> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32, &RetryConfig) -> bool + Send + Sync,
    {
        fn should_retry(&self, error: &E, attempt: u32, config: &RetryConfig) -> bool {
            (self.predicate)(error, attempt, config)
        }
    }
}

type RetryHook<E> = Arc<dyn Fn(&E, u32) + Send + Sync>;
type ExhaustedHook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Result of a retried call together with what it cost.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Sum of all backoff waits
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Runs operations with bounded, backed-off retries.
pub struct RetryManager<E> {
    config: RetryConfig,
    policy: Arc<dyn RetryPolicy<E>>,
    on_retry: Option<RetryHook<E>>,
    on_max_retries_reached: Option<ExhaustedHook<E>>,
}

impl<E> Clone for RetryManager<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            policy: Arc::clone(&self.policy),
            on_retry: self.on_retry.clone(),
            on_max_retries_reached: self.on_max_retries_reached.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .field("on_max_retries_reached", &self.on_max_retries_reached.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: 'static> RetryManager<E> {
    /// Create a manager using the default [`policies::UntilMaxRetries`]
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    pub fn with_defaults() -> Self {
        Self::from_valid(RetryConfig::default())
    }

    fn from_valid(config: RetryConfig) -> Self {
        Self {
            config,
            policy: Arc::new(policies::UntilMaxRetries),
            on_retry: None,
            on_max_retries_reached: None,
        }
    }
}

impl<E> RetryManager<E> {
    /// Replace the retry condition
    pub fn with_policy<P>(mut self, policy: P) -> Self
    where
        P: RetryPolicy<E> + 'static,
    {
        self.policy = Arc::new(policy);
        self
    }

    /// Replace the retry condition with a closure
    pub fn with_retry_condition<F>(self, condition: F) -> Self
    where
        F: Fn(&E, u32, &RetryConfig) -> bool + Send + Sync + 'static,
    {
        self.with_policy(policies::PredicateRetry::new(condition))
    }

    /// Hook invoked right before each backoff wait
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Hook invoked once when the call gives up
    pub fn on_max_retries_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.on_max_retries_reached = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub(crate) fn should_retry(&self, error: &E, attempt: u32) -> bool {
        attempt <= self.config.max_retries && self.policy.should_retry(error, attempt, &self.config)
    }

    /// Run `operation`, retrying failures the policy accepts.
    ///
    /// Returns the first success, or the last error once retries are
    /// exhausted or the policy declines.
    #[instrument(skip(self, operation), fields(max_retries = self.config.max_retries))]
    pub async fn execute<F, Fut, T>(&self, operation: F, context: &str) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with_outcome(operation, context).await.into_result()
    }

    /// Like [`execute`](Self::execute), also reporting attempts and total
    /// delay.
    pub async fn execute_with_outcome<F, Fut, T>(
        &self,
        operation: F,
        context: &str,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_gated(operation, context, |_error| true).await
    }

    /// Retry loop with an extra per-call condition.
    ///
    /// `keep_going` is checked after the policy and before any hook or
    /// wait, so a declined retry never announces itself.
    pub(crate) async fn execute_gated<F, Fut, T, G>(
        &self,
        mut operation: F,
        context: &str,
        keep_going: G,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(context, retries = attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome { result: Ok(value), attempts: attempt + 1, total_delay };
                }
                Err(error) => {
                    attempt += 1;

                    if !(self.should_retry(&error, attempt) && keep_going(&error)) {
                        warn!(context, attempts = attempt, error = %error, "Giving up on operation");
                        if let Some(hook) = &self.on_max_retries_reached {
                            hook(&error);
                        }
                        return RetryOutcome { result: Err(error), attempts: attempt, total_delay };
                    }

                    let delay = self.config.delay_for(attempt);
                    warn!(
                        context,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(&error, attempt);
                    }

                    tokio::time::sleep(delay).await;
                    total_delay += delay;
                    debug!(context, attempt, "Retrying operation");
                }
            }
        }
    }
}
