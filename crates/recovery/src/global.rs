//! Process-wide recovery manager.
//!
//! The shared instance is built lazily on first access with default options
//! and a [`TracingNotifier`]. Applications that want different settings
//! install their own with [`init_error_recovery_manager`] before first use;
//! tests call [`reset_error_recovery_manager`] to avoid leaking breaker state
//! between cases.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::api::ApiError;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RecoveryOptions;
use crate::error::ConfigResult;
use crate::factory::create_error_recovery_manager;
use crate::manager::ErrorRecoveryManager;
use crate::notify::{Notifier, TracingNotifier};
use crate::retry::RetryManager;

/// Manager type shared through this module
pub type SharedRecoveryManager = Arc<ErrorRecoveryManager<ApiError>>;

static GLOBAL_MANAGER: Lazy<RwLock<Option<SharedRecoveryManager>>> =
    Lazy::new(|| RwLock::new(None));

/// Return the shared manager, creating it on first call.
pub fn error_recovery_manager() -> SharedRecoveryManager {
    if let Some(manager) = GLOBAL_MANAGER.read().as_ref() {
        return Arc::clone(manager);
    }

    let mut slot = GLOBAL_MANAGER.write();
    // Another caller may have initialized it between the two locks.
    if let Some(manager) = slot.as_ref() {
        return Arc::clone(manager);
    }

    debug!("Initializing global error recovery manager");
    let manager = Arc::new(default_manager());
    *slot = Some(Arc::clone(&manager));
    manager
}

/// Replace the shared manager with one built from `options`.
pub fn init_error_recovery_manager(
    options: RecoveryOptions,
    notifier: Arc<dyn Notifier>,
) -> ConfigResult<SharedRecoveryManager> {
    let manager = Arc::new(create_error_recovery_manager(options, notifier)?);
    *GLOBAL_MANAGER.write() = Some(Arc::clone(&manager));
    debug!("Installed configured global error recovery manager");
    Ok(manager)
}

/// Drop the shared manager; the next access builds a fresh one.
pub fn reset_error_recovery_manager() {
    GLOBAL_MANAGER.write().take();
}

fn default_manager() -> ErrorRecoveryManager<ApiError> {
    match create_error_recovery_manager(RecoveryOptions::default(), Arc::new(TracingNotifier)) {
        Ok(manager) => manager,
        Err(e) => {
            // Default options always validate; keep a bare manager if that ever changes.
            error!(error = %e, "Default recovery options rejected, using bare manager");
            ErrorRecoveryManager::new(RetryManager::with_defaults(), CircuitBreaker::with_defaults())
        }
    }
}
