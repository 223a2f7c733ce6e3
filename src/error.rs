//! Error taxonomy for provider connection lifecycle operations
//!
//! Every failure that crosses a component boundary is a [`LifecycleError`], and
//! every consumer that needs to decide what to do with one (the retry wrapper,
//! the notification layer) asks [`classify`] for its [`ErrorKind`] instead of
//! matching on variants itself.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for provider lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Provider not initialized: {provider_id}")]
    NotInitialized { provider_id: String },

    #[error("No template connection available for provider: {provider_id}")]
    TemplateUnavailable { provider_id: String },

    #[error("Connection pool exhausted for provider {provider_id} (max size {max_size})")]
    PoolExhausted { provider_id: String, max_size: usize },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Operation timed out: {message}")]
    Timeout { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Classification of a [`LifecycleError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotInitialized,
    TemplateUnavailable,
    PoolExhausted,
    ConnectionFailed,
    Timeout,
    Internal,
    Cancelled,
}

impl ErrorKind {
    /// Only transient provider failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ConnectionFailed | ErrorKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::TemplateUnavailable => "template_unavailable",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleError {
    /// Create not-initialized error
    pub fn not_initialized<S: Into<String>>(provider_id: S) -> Self {
        Self::NotInitialized {
            provider_id: provider_id.into(),
        }
    }

    /// Create template-unavailable error
    pub fn template_unavailable<S: Into<String>>(provider_id: S) -> Self {
        Self::TemplateUnavailable {
            provider_id: provider_id.into(),
        }
    }

    /// Create pool-exhausted error
    pub fn pool_exhausted<S: Into<String>>(provider_id: S, max_size: usize) -> Self {
        Self::PoolExhausted {
            provider_id: provider_id.into(),
            max_size,
        }
    }

    /// Create connection failure error
    pub fn connection_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an unclassified error, keeping its message verbatim
    pub fn passthrough<E: fmt::Display + ?Sized>(err: &E) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NotInitialized { .. } => ErrorKind::NotInitialized,
            LifecycleError::TemplateUnavailable { .. } => ErrorKind::TemplateUnavailable,
            LifecycleError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            LifecycleError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            LifecycleError::Timeout { .. } => ErrorKind::Timeout,
            LifecycleError::Internal { .. } | LifecycleError::Config(_) => ErrorKind::Internal,
            LifecycleError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Message suitable for records and notifications
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

impl From<io::Error> for LifecycleError {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        match classify_io(&err) {
            ErrorKind::ConnectionFailed => Self::ConnectionFailed { message },
            ErrorKind::Timeout => Self::Timeout { message },
            _ => Self::Internal { message },
        }
    }
}

/// Single classifier consumed by retry and notification policy
pub fn classify(err: &LifecycleError) -> ErrorKind {
    err.kind()
}

/// Classify an OS-level I/O error
pub fn classify_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionFailed,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
        _ => match err.raw_os_error() {
            // EHOSTUNREACH / ENETUNREACH on Linux
            Some(113) | Some(101) => ErrorKind::ConnectionFailed,
            _ => ErrorKind::Internal,
        },
    }
}

/// Classify a symbolic network error code such as `ECONNREFUSED`
pub fn classify_code(code: &str) -> ErrorKind {
    match code.to_ascii_uppercase().as_str() {
        "ECONNREFUSED" | "ECONNRESET" | "ECONNABORTED" | "ENOTFOUND" | "EHOSTUNREACH"
        | "ENETUNREACH" | "EPIPE" | "EAI_AGAIN" => ErrorKind::ConnectionFailed,
        "ETIMEDOUT" | "ESOCKETTIMEDOUT" => ErrorKind::Timeout,
        _ => ErrorKind::Internal,
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SECRET_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("secret path pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and secret paths, and bound the message length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SECRET_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;
