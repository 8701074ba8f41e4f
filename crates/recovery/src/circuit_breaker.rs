//! Three-state circuit breaker.
//!
//! | State | On call | On success | On failure |
//! |-------|---------|------------|------------|
//! | closed | run | reset failures | count; open at threshold |
//! | open | half-open and run once `reset_timeout` has passed since the last failure, else reject | - | - |
//! | half-open | run (probe) | close, reset counters | reopen |
//!
//! The open → half-open transition is evaluated lazily on the next call;
//! nothing runs in the background. The state lock is only held while
//! reading or updating counters, never across the wrapped operation, so
//! concurrent callers on one breaker may interleave their updates.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_MONITORING_PERIOD, DEFAULT_RESET_TIMEOUT,
};
use crate::error::{ConfigError, ConfigResult, RecoveryError, RecoveryResult};
use crate::serde_util::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without running
    Open,
    /// One probe is let through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before the circuit opens
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed
    #[serde(rename = "reset_timeout_ms", with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Reserved for windowed failure counting; accepted but not enforced
    #[serde(rename = "monitoring_period_ms", with = "duration_millis")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            monitoring_period: DEFAULT_MONITORING_PERIOD,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn monitoring_period(mut self, period: Duration) -> Self {
        self.config.monitoring_period = period;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Calls that reached the breaker, rejected or not
    pub total_calls: u64,
    /// Calls failed fast while open
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    /// Configured window; reported only, failures are counted cumulatively
    pub monitoring_period: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            total_calls: 0,
            rejected_calls: 0,
        }
    }

    /// Move to `next`, returning it if this was a real change
    fn transition(&mut self, next: CircuitState) -> Option<CircuitState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

type StateChangeHook = Arc<dyn Fn(CircuitState) + Send + Sync>;

/// Circuit breaker guarding one logical dependency.
///
/// Clones share state, so a breaker can be handed to several call sites.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
    on_state_change: Option<StateChangeHook>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
            on_state_change: self.on_state_change.clone(),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    pub fn with_defaults() -> Self {
        Self::from_valid(CircuitBreakerConfig::default(), SystemClock)
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker reading time from `clock`
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_valid(config, clock))
    }

    fn from_valid(config: CircuitBreakerConfig, clock: C) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState::new())),
            clock: Arc::new(clock),
            on_state_change: None,
        }
    }

    /// Hook fired with the new state on every real transition
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// While open and inside the reset timeout the call fails fast with
    /// [`RecoveryError::CircuitOpen`] and `operation` is never invoked.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F, context: &str) -> RecoveryResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.admit(context)?;

        match operation().await {
            Ok(value) => {
                self.record_success(context);
                Ok(value)
            }
            Err(error) => {
                debug!(context, error = %error, "Circuit breaker saw a failed call");
                self.record_failure(context);
                Err(RecoveryError::Operation(error))
            }
        }
    }

    fn admit<E>(&self, context: &str) -> RecoveryResult<(), E> {
        let (admitted, changed) = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;

            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open => {
                    let cooled_down = inner.last_failure_time.map_or(true, |failed_at| {
                        self.clock.now().saturating_duration_since(failed_at)
                            >= self.config.reset_timeout
                    });
                    if cooled_down {
                        (true, inner.transition(CircuitState::HalfOpen))
                    } else {
                        inner.rejected_calls += 1;
                        (false, None)
                    }
                }
            }
        };

        self.announce(changed, context);

        if admitted {
            Ok(())
        } else {
            debug!(context, "Circuit breaker open, rejecting call");
            Err(RecoveryError::circuit_open(context))
        }
    }

    fn record_success(&self, context: &str) {
        let changed = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    let changed = inner.transition(CircuitState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    changed
                }
                CircuitState::Open => {
                    // Another caller reopened the circuit while this call ran.
                    debug!(context, "Success recorded while circuit is open");
                    None
                }
            }
        };

        self.announce(changed, context);
    }

    fn record_failure(&self, context: &str) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.failure_count += 1;
            inner.last_failure_time = Some(self.clock.now());

            match inner.state {
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.transition(CircuitState::Open)
                }
                CircuitState::HalfOpen => inner.transition(CircuitState::Open),
                CircuitState::Closed | CircuitState::Open => None,
            }
        };

        self.announce(changed, context);
    }

    /// Log a transition and fire the hook, outside the state lock
    fn announce(&self, changed: Option<CircuitState>, context: &str) {
        let Some(state) = changed else {
            return;
        };

        match state {
            CircuitState::Open => warn!(
                context,
                failure_threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(context, "Circuit breaker half-open, probing"),
            CircuitState::Closed => info!(context, "Circuit breaker closed"),
        }

        if let Some(hook) = &self.on_state_change {
            hook(state);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure_time,
            monitoring_period: self.config.monitoring_period,
        }
    }

    /// Force the circuit closed and clear its counters
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.last_failure_time = None;
            inner.transition(CircuitState::Closed)
        };

        info!("Circuit breaker manually reset");
        self.announce(changed, "reset");
    }
}
