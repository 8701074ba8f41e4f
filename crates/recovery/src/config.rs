//! Recovery policy configuration and loading
//!
//! ## Loading Strategy
//! 1. Start from the built-in defaults
//! 2. If a file is given, replace them with its contents (fields missing
//!    from the file keep their defaults)
//! 3. Apply `INSPECTRA_RECOVERY_*` environment overrides
//! 4. Validate the result
//!
//! ## Environment Variables
//! - `INSPECTRA_RECOVERY_MAX_RETRIES`: Retries after the first attempt
//! - `INSPECTRA_RECOVERY_BASE_DELAY_MS`: Delay before the first retry
//! - `INSPECTRA_RECOVERY_MAX_DELAY_MS`: Cap on any single retry delay
//! - `INSPECTRA_RECOVERY_BACKOFF_FACTOR`: Per-retry delay multiplier
//! - `INSPECTRA_RECOVERY_FAILURE_THRESHOLD`: Failures before the circuit
//!   opens
//! - `INSPECTRA_RECOVERY_RESET_TIMEOUT_MS`: Cooldown before a half-open
//!   probe
//! - `INSPECTRA_RECOVERY_MONITORING_PERIOD_MS`: Reserved failure window
//! - `INSPECTRA_RECOVERY_NOTIFICATIONS`: Whether user-facing notifications
//!   are raised (true/false)
//!
//! ## File Formats
//! TOML and JSON, detected by file extension:
//!
//! ```toml
//! enable_notifications = false
//!
//! [retry]
//! max_retries = 2
//! base_delay_ms = 500
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! reset_timeout_ms = 30000
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::constants::ENV_PREFIX;
use crate::error::{ConfigError, ConfigResult};
use crate::retry::RetryConfig;

/// Options for a complete recovery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    /// Raise toast-style notifications from the default hooks and handlers
    pub enable_notifications: bool,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            enable_notifications: true,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RecoveryOptions {
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()
    }

    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::Parse { format: "TOML", message: e.to_string() })
    }

    pub fn from_json_str(contents: &str) -> ConfigResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| ConfigError::Parse { format: "JSON", message: e.to_string() })
    }

    /// Read options from a `.toml` or `.json` file.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnsupportedFormat`] for any other extension,
    /// [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if its contents are malformed.
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        let parse: fn(&str) -> ConfigResult<Self> = match extension {
            "toml" => Self::from_toml_str,
            "json" => Self::from_json_str,
            _ => return Err(ConfigError::UnsupportedFormat { path: path.to_path_buf() }),
        };

        info!(path = %path.display(), "Loading recovery configuration from file");

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        parse(&contents)
    }

    /// Apply `INSPECTRA_RECOVERY_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    ///
    /// `lookup` receives full variable names, prefix included.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let key = format!("{ENV_PREFIX}{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("MAX_RETRIES") {
            self.retry.max_retries = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("BASE_DELAY_MS") {
            self.retry.base_delay = Duration::from_millis(parse_env(&key, &value)?);
        }
        if let Some((key, value)) = var("MAX_DELAY_MS") {
            self.retry.max_delay = Duration::from_millis(parse_env(&key, &value)?);
        }
        if let Some((key, value)) = var("BACKOFF_FACTOR") {
            self.retry.backoff_factor = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("RESET_TIMEOUT_MS") {
            self.circuit_breaker.reset_timeout = Duration::from_millis(parse_env(&key, &value)?);
        }
        if let Some((key, value)) = var("MONITORING_PERIOD_MS") {
            self.circuit_breaker.monitoring_period =
                Duration::from_millis(parse_env(&key, &value)?);
        }
        if let Some((key, value)) = var("NOTIFICATIONS") {
            self.enable_notifications = parse_bool(&key, &value)?;
        }

        Ok(())
    }
}

/// Load options: defaults, then `path` if given, then environment
/// overrides, then validation.
pub fn load(path: Option<&Path>) -> ConfigResult<RecoveryOptions> {
    let mut options = match path {
        Some(path) => RecoveryOptions::load_from_file(path)?,
        None => {
            debug!("No recovery configuration file given, using defaults");
            RecoveryOptions::default()
        }
    };

    options.apply_env_overrides()?;
    options.validate()?;
    Ok(options)
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { variable: key.to_string(), value: value.to_string() })
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env { variable: key.to_string(), value: value.to_string() }),
    }
}
