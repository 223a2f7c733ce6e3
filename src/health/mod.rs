//! Health checking for providers and for the processes that host them
//!
//! [`monitor`] checks providers while they are connected and escalates
//! sustained failure. [`process`] samples CPU and memory of OS processes.

pub mod monitor;
pub mod process;

pub use monitor::{HealthMonitor, HealthMonitorConfig, HealthRecord};
pub use process::{
    ProcessHealth, ProcessMonitor, ProcessMonitorConfig, ProcessSample, ProcessSampler,
    ProcessStatus, SysinfoSampler, WarningDecay,
};

use crate::error::LifecycleError;
use crate::provider::ProviderHandle;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Outcome reported by a [`HealthCheck`]
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub latency: Duration,
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency,
            error: None,
        }
    }

    pub fn unhealthy<S: Into<String>>(error: S) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency: Duration::ZERO,
            error: Some(error.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Caller-supplied health check for a provider
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, provider_id: &str) -> Result<HealthCheckResult, LifecycleError>;
}

/// Check used when none is configured: always healthy, zero latency
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn check(&self, _provider_id: &str) -> Result<HealthCheckResult, LifecycleError> {
        Ok(HealthCheckResult::healthy(Duration::ZERO))
    }
}

/// Dedicated session used only for pinging one provider
#[derive(Debug)]
struct PingTarget {
    source: ProviderHandle,
    session: Mutex<Option<ProviderHandle>>,
}

impl PingTarget {
    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.shutdown().await {
                debug!(provider_id = %session.id(), error = %e, "Ping session shutdown failed");
            }
        }
    }
}

/// Health check that pings each provider over a session of its own.
///
/// The session is forked from the registered handle on the first check and is
/// never pooled, so a ping never lands on a handle a caller holds. The
/// registered handle is only used to fork from. A session whose connect or
/// ping fails is shut down and forked again on the next check.
#[derive(Debug, Default)]
pub struct PingHealthCheck {
    targets: RwLock<HashMap<String, Arc<PingTarget>>>,
}

impl PingHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ping `handle`'s provider from now on, closing any session left from
    /// an earlier registration.
    pub async fn register(&self, handle: ProviderHandle) {
        let target = Arc::new(PingTarget {
            source: handle.clone(),
            session: Mutex::new(None),
        });
        let previous = self
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().to_string(), target);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    pub async fn unregister(&self, provider_id: &str) -> bool {
        let removed = self
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id);
        match removed {
            Some(target) => {
                target.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every ping session and forget every provider
    pub async fn dispose(&self) {
        let targets: Vec<Arc<PingTarget>> = self
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, target)| target)
            .collect();
        for target in targets {
            target.close().await;
        }
    }

    fn target(&self, provider_id: &str) -> Option<Arc<PingTarget>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }
}

#[async_trait]
impl HealthCheck for PingHealthCheck {
    async fn check(&self, provider_id: &str) -> Result<HealthCheckResult, LifecycleError> {
        let target = self
            .target(provider_id)
            .ok_or_else(|| LifecycleError::not_initialized(provider_id))?;
        let mut session = target.session.lock().await;

        let handle = match session.clone() {
            Some(handle) => handle,
            None => {
                let handle = target.source.fork();
                if let Err(e) = handle.connect().await {
                    warn!(provider_id = %provider_id, error = %e, "Ping session connect failed");
                    if let Err(cleanup) = handle.shutdown().await {
                        debug!(provider_id = %provider_id, error = %cleanup, "Cleanup of ping session failed");
                    }
                    return Err(e);
                }
                debug!(provider_id = %provider_id, "Opened ping session");
                session.insert(handle).clone()
            }
        };

        match handle.ping().await {
            Ok(latency) => {
                debug!(
                    provider_id = %provider_id,
                    latency_ms = latency.as_millis() as u64,
                    "Provider ping succeeded"
                );
                Ok(HealthCheckResult::healthy(latency))
            }
            Err(e) => {
                warn!(provider_id = %provider_id, error = %e, "Provider ping failed");
                session.take();
                if let Err(cleanup) = handle.shutdown().await {
                    debug!(provider_id = %provider_id, error = %cleanup, "Cleanup of ping session failed");
                }
                Err(e)
            }
        }
    }
}
