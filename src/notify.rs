//! User-facing notifications for failures and health degradation
//!
//! Rendering is someone else's job. Components hand a [`Notification`] to the
//! attached [`NotificationSink`]; [`TracingSink`] is the default and simply logs.

use crate::error::sanitize_error_message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// One notification. The message is sanitised on construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub provider_id: Option<String>,
    pub pid: Option<u32>,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new<T: Into<String>>(level: NotificationLevel, title: T, message: &str) -> Self {
        Self {
            level,
            title: title.into(),
            message: sanitize_error_message(message),
            provider_id: None,
            pid: None,
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn warning<T: Into<String>>(title: T, message: &str) -> Self {
        Self::new(NotificationLevel::Warning, title, message)
    }

    pub fn error<T: Into<String>>(title: T, message: &str) -> Self {
        Self::new(NotificationLevel::Error, title, message)
    }

    pub fn critical<T: Into<String>>(title: T, message: &str) -> Self {
        Self::new(NotificationLevel::Critical, title, message)
    }

    pub fn for_provider<S: Into<String>>(mut self, provider_id: S) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn for_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Receiver of notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink that writes notifications to the log at the matching level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        let provider_id = notification.provider_id.as_deref().unwrap_or("-");
        let context = notification
            .context
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        match notification.level {
            NotificationLevel::Info => info!(
                provider_id,
                pid = ?notification.pid,
                context = %context,
                "{}: {}",
                notification.title,
                notification.message
            ),
            NotificationLevel::Warning => warn!(
                provider_id,
                pid = ?notification.pid,
                context = %context,
                "{}: {}",
                notification.title,
                notification.message
            ),
            NotificationLevel::Error | NotificationLevel::Critical => error!(
                provider_id,
                pid = ?notification.pid,
                level = %notification.level,
                context = %context,
                "{}: {}",
                notification.title,
                notification.message
            ),
        }
    }
}
