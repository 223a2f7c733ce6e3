//! Provider Lifecycle - connection lifecycle management for pluggable backends
//!
//! This crate manages the runtime lifecycle of provider connections, including:
//! - Bounded per-provider connection pools with idle reaping
//! - Retry with exponential backoff driven by a single error classifier
//! - Per-provider state tracking over a typed event bus
//! - Periodic health checks and local process resource monitoring
//! - Rolling request metrics
//!
//! # Quick Start
//!
//! ```rust
//! use provider_lifecycle::testing::MockProvider;
//! use provider_lifecycle::{LifecycleConfig, ProviderLifecycle, ProviderState};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let lifecycle = ProviderLifecycle::new(LifecycleConfig::default()).unwrap();
//! lifecycle.register(Arc::new(MockProvider::new("local-llm"))).await.unwrap();
//!
//! let answer = lifecycle
//!     .execute("local-llm", |handle| async move { Ok(handle.id().to_uppercase()) })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(answer, "LOCAL-LLM");
//! assert_eq!(lifecycle.get_current_state("local-llm"), Some(ProviderState::Connected));
//! lifecycle.shutdown().await;
//! # });
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod notify;
pub mod observability;
pub mod pool;
pub mod provider;
pub mod retry;
pub mod state;
pub mod testing;

pub use observability::metrics;

pub use config::{ConfigError, LifecycleConfig};
pub use error::{classify, ErrorKind, LifecycleError, LifecycleResult};
pub use events::{
    EventBus, EventSink, HealthAlert, LifecycleEvent, ProviderEvent, ProviderState,
    StateTransition, SubscriptionId, Topic,
};
pub use health::{
    HealthCheck, HealthCheckResult, HealthMonitor, HealthRecord, HealthStatus, ProcessHealth,
    ProcessMonitor, ProcessStatus, WarningDecay,
};
pub use lifecycle::{LifecycleBuilder, ProviderLifecycle};
pub use metrics::{MetricsSnapshot, MetricsTracker};
pub use notify::{Notification, NotificationLevel, NotificationSink};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use provider::{Provider, ProviderHandle};
pub use retry::{RetryConfig, RetryExecutor};
pub use state::StateManager;
