//! Default values for the recovery policy.

use std::time::Duration;

/// Default maximum number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Default upper bound on any single retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Default multiplier applied per retry
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Circuit breaker: failures before the circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker: cooldown before a half-open probe is allowed
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Circuit breaker: reserved window for failure counting (not enforced)
pub const DEFAULT_MONITORING_PERIOD: Duration = Duration::from_millis(10_000);

/// Attempt cap used by the default network/server retry condition
pub const DEFAULT_RETRY_ATTEMPT_CAP: u32 = 3;

/// Largest exponent fed into the backoff calculation
pub const MAX_BACKOFF_EXPONENT: u32 = 64;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "INSPECTRA_RECOVERY_";
