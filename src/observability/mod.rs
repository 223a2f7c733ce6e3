//! Observability: structured logging setup and per-provider metrics
//!
//! Logging follows the usual tracing layout; metrics are tracked per provider
//! and can be published periodically on the event bus.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsConfig, MetricsRecord, MetricsSnapshot, MetricsTracker};

// Span macros for structured logging
pub use logging::{health_span, pool_span, provider_span};
