//! User-facing notifications raised by the default recovery policy.
//!
//! These are advisory toast-style signals ("Retrying (2/3)", "Service
//! restored"). The recovery logic never depends on them being delivered.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// A single toast-equivalent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self { level, title: title.into(), message: message.into() }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, title, message)
    }
}

/// Sink for user-facing notifications.
///
/// Called synchronously from retry and breaker hooks, so implementations
/// should hand the notification off rather than block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Emits notifications as `tracing` events on the `notification` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let Notification { level, title, message } = notification;
        match level {
            NotificationLevel::Info | NotificationLevel::Success => {
                info!(target: "notification", %level, %title, "{message}")
            }
            NotificationLevel::Warning => warn!(target: "notification", %level, %title, "{message}"),
            NotificationLevel::Error => error!(target: "notification", %level, %title, "{message}"),
        }
    }
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_constructors() {
        let toast = Notification::warning("Retrying", "Retrying (1/3)");
        assert_eq!(toast.level, NotificationLevel::Warning);
        assert_eq!(toast.title, "Retrying");
        assert_eq!(toast.message, "Retrying (1/3)");
        assert_eq!(Notification::success("a", "b").level, NotificationLevel::Success);
    }

    #[test]
    fn test_notification_level_serializes_lowercase() {
        let json = serde_json::to_string(&NotificationLevel::Success).expect("serialize level");
        assert_eq!(json, "\"success\"");
        assert_eq!(NotificationLevel::Error.to_string(), "error");
    }

    /// Tests that the built-in notifiers accept every level without panicking
    #[test]
    fn test_builtin_notifiers_accept_all_levels() {
        for notification in [
            Notification::info("i", "info"),
            Notification::success("s", "success"),
            Notification::warning("w", "warning"),
            Notification::error("e", "error"),
        ] {
            TracingNotifier.notify(notification.clone());
            NoopNotifier.notify(notification);
        }
    }
}
