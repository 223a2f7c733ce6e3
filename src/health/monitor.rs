//! Periodic provider health probing driven by state transitions
//!
//! The monitor listens for `stateChange` events. A transition into
//! `connected` starts a check loop for that provider (once); a transition into
//! `disconnected` stops it. Check failures are captured in the provider's
//! [`HealthRecord`] and never take the loop down.

use super::{AlwaysHealthy, HealthCheck};
use crate::error::sanitize_error_message;
use crate::events::{
    EventBus, HealthAlert, LifecycleEvent, ProviderState, StateTransition, SubscriptionId, Topic,
};
use crate::notify::{Notification, NotificationSink, TracingSink};
use crate::observability::metrics::MetricsTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    /// Consecutive failed checks that escalate to critical
    pub critical_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            critical_threshold: 3,
        }
    }
}

/// Latest check outcome for one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub provider_id: String,
    pub is_healthy: bool,
    /// Check latency in milliseconds, -1 when the check failed
    pub latency_ms: i64,
    pub last_check_at: DateTime<Utc>,
    /// Consecutive failed checks
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Whether the current failure streak has escalated
    pub critical: bool,
}

/// Checks connected providers on an interval
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    bus: EventBus,
    check: Arc<dyn HealthCheck>,
    metrics: Option<Arc<MetricsTracker>>,
    notifier: Arc<dyn NotificationSink>,
    records: Mutex<HashMap<String, HealthRecord>>,
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    disposed: AtomicBool,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            check: Arc::new(AlwaysHealthy),
            metrics: None,
            notifier: Arc::new(TracingSink),
            records: Mutex::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.check = check;
        self
    }

    /// Feed every check outcome into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsTracker>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Subscribe to state transitions on the bus. Calling it again does nothing.
    pub fn attach(self: &Arc<Self>) {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() || self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *subscription = Some(self.bus.subscribe(Topic::StateChange, move |event| {
            if let (Some(monitor), LifecycleEvent::StateChange(transition)) =
                (weak.upgrade(), event)
            {
                monitor.on_state_change(transition);
            }
        }));
    }

    fn on_state_change(self: &Arc<Self>, transition: &StateTransition) {
        match transition.new_state {
            ProviderState::Connected => self.start_monitoring(&transition.provider_id),
            ProviderState::Disconnected => self.stop_monitoring(&transition.provider_id),
            _ => {}
        }
    }

    /// Start the check loop for `provider_id` unless one is already running
    pub fn start_monitoring(self: &Arc<Self>, provider_id: &str) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if loops
            .get(provider_id)
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!(provider_id = %provider_id, "Health monitoring already running");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(provider_id = %provider_id, "No async runtime, health monitoring not started");
            return;
        };

        let weak = Arc::downgrade(self);
        let id = provider_id.to_string();
        let interval = self.config.interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it

            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                monitor
                    .check_now(&id)
                    .instrument(crate::health_span!(provider_id = %id))
                    .await;
            }
        });

        loops.insert(provider_id.to_string(), handle);
        info!(
            provider_id = %provider_id,
            interval_secs = interval.as_secs(),
            "Started health monitoring"
        );
    }

    /// Stop the check loop for `provider_id`. The last record is kept.
    pub fn stop_monitoring(&self, provider_id: &str) {
        let removed = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id);
        if let Some(handle) = removed {
            handle.abort();
            info!(provider_id = %provider_id, "Stopped health monitoring");
        }
    }

    pub fn is_monitoring(&self, provider_id: &str) -> bool {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn active_monitors(&self) -> Vec<String> {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_health(&self, provider_id: &str) -> Option<HealthRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    /// Run one check now and publish its outcome
    pub async fn check_now(&self, provider_id: &str) -> HealthRecord {
        let outcome = match self.check.check(provider_id).await {
            Ok(result) if result.is_healthy() => Ok(result.latency),
            Ok(result) => Err(result
                .error
                .unwrap_or_else(|| format!("health status {:?}", result.status))),
            Err(e) => Err(e.to_string()),
        };

        let (record, escalated) = self.update_record(provider_id, outcome);

        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.record_health(provider_id, record.is_healthy) {
                debug!(provider_id = %provider_id, error = %e, "Health not recorded in metrics");
            }
        }

        if record.is_healthy {
            debug!(provider_id = %provider_id, latency_ms = record.latency_ms, "Health check passed");
        } else {
            warn!(
                provider_id = %provider_id,
                error_count = record.error_count,
                error = record.last_error.as_deref().unwrap_or_default(),
                "Health check failed"
            );
        }

        self.bus.publish(LifecycleEvent::HealthUpdate(record.clone()));

        if escalated {
            error!(
                provider_id = %provider_id,
                error_count = record.error_count,
                "Provider health critical"
            );
            self.bus.publish(LifecycleEvent::HealthCritical(HealthAlert::Provider(
                record.clone(),
            )));
            self.notifier.notify(
                Notification::critical(
                    "Provider health critical",
                    record.last_error.as_deref().unwrap_or("health checks failing"),
                )
                .for_provider(provider_id)
                .with_context(serde_json::json!({
                    "error_count": record.error_count,
                    "last_check_at": record.last_check_at,
                })),
            );
        }

        record
    }

    /// Returns the new record and whether this check escalated to critical
    fn update_record(
        &self,
        provider_id: &str,
        outcome: Result<Duration, String>,
    ) -> (HealthRecord, bool) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = records.get(provider_id);
        let was_critical = previous.is_some_and(|record| record.critical);
        let previous_errors = previous.map_or(0, |record| record.error_count);

        let (record, escalated) = match outcome {
            Ok(latency) => (
                HealthRecord {
                    provider_id: provider_id.to_string(),
                    is_healthy: true,
                    latency_ms: latency.as_millis() as i64,
                    last_check_at: Utc::now(),
                    error_count: 0,
                    last_error: None,
                    critical: false,
                },
                false,
            ),
            Err(message) => {
                let error_count = previous_errors + 1;
                let critical = error_count >= self.config.critical_threshold;
                (
                    HealthRecord {
                        provider_id: provider_id.to_string(),
                        is_healthy: false,
                        latency_ms: -1,
                        last_check_at: Utc::now(),
                        error_count,
                        last_error: Some(sanitize_error_message(&message)),
                        critical,
                    },
                    critical && !was_critical,
                )
            }
        };

        records.insert(provider_id.to_string(), record.clone());
        (record, escalated)
    }

    /// Unsubscribe and stop every loop. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(id) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.bus.unsubscribe(id);
        }

        let loops: Vec<(String, JoinHandle<()>)> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in &loops {
            handle.abort();
        }
        info!(stopped = loops.len(), "Health monitor disposed");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for (_, handle) in self
            .loops
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("active_monitors", &self.active_monitors())
            .finish()
    }
}
