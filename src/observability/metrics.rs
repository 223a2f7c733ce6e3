//! Per-provider request and health accounting
//!
//! Counters are kept per provider behind one mutex. Average response time is
//! the plain mean of a bounded window of recent samples, recomputed from the
//! window on every update.

use crate::error::{sanitize_error_message, LifecycleError, LifecycleResult};
use crate::events::{EventBus, LifecycleEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Samples kept for the rolling response time
    pub window_size: usize,
    /// Interval of the `metrics:updated` publisher
    pub update_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            update_interval: Duration::from_secs(5),
        }
    }
}

/// Live counters for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub token_usage: Option<u64>,
    /// Mean of the response time window, in milliseconds
    pub average_response_time: f64,
    pub last_error: Option<String>,
    pub health_checks: u64,
    pub health_failures: u64,
    pub last_updated: DateTime<Utc>,
    window: VecDeque<f64>,
}

impl MetricsRecord {
    fn new() -> Self {
        Self {
            total_requests: 0,
            success_count: 0,
            error_count: 0,
            token_usage: None,
            average_response_time: 0.0,
            last_error: None,
            health_checks: 0,
            health_failures: 0,
            last_updated: Utc::now(),
            window: VecDeque::new(),
        }
    }

    fn push_sample(&mut self, response_time: Duration, window_size: usize) {
        self.window.push_back(response_time.as_secs_f64() * 1000.0);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
        self.average_response_time = self.window.iter().sum::<f64>() / self.window.len() as f64;
    }

    fn snapshot(&self, provider_id: &str) -> MetricsSnapshot {
        MetricsSnapshot {
            provider_id: provider_id.to_string(),
            total_requests: self.total_requests,
            success_count: self.success_count,
            error_count: self.error_count,
            token_usage: self.token_usage,
            average_response_time: self.average_response_time,
            samples: self.window.len(),
            last_error: self.last_error.clone(),
            health_checks: self.health_checks,
            health_failures: self.health_failures,
            last_updated: self.last_updated,
        }
    }
}

/// Read-only copy of a provider's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub provider_id: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub token_usage: Option<u64>,
    pub average_response_time: f64,
    /// Samples behind `average_response_time`
    pub samples: usize,
    pub last_error: Option<String>,
    pub health_checks: u64,
    pub health_failures: u64,
    pub last_updated: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Successful share of requests in `[0, 1]`, zero when nothing was recorded
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_requests as f64
        }
    }
}

pub struct MetricsTracker {
    config: MetricsConfig,
    records: Mutex<HashMap<String, MetricsRecord>>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsTracker {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config: MetricsConfig {
                window_size: config.window_size.max(1),
                ..config
            },
            records: Mutex::new(HashMap::new()),
            updater: Mutex::new(None),
        }
    }

    /// Start tracking with zeroed counters. Existing records are kept.
    pub fn initialize(&self, provider_id: &str) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(provider_id.to_string())
            .or_insert_with(MetricsRecord::new);
    }

    fn update<F>(&self, provider_id: &str, apply: F) -> LifecycleResult<()>
    where
        F: FnOnce(&mut MetricsRecord, usize),
    {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(provider_id)
            .ok_or_else(|| LifecycleError::not_initialized(provider_id))?;
        apply(record, self.config.window_size);
        record.last_updated = Utc::now();
        Ok(())
    }

    pub fn record_success(
        &self,
        provider_id: &str,
        response_time: Duration,
        token_count: Option<u64>,
    ) -> LifecycleResult<()> {
        self.update(provider_id, |record, window_size| {
            record.total_requests += 1;
            record.success_count += 1;
            if let Some(tokens) = token_count {
                record.token_usage = Some(record.token_usage.unwrap_or(0) + tokens);
            }
            record.push_sample(response_time, window_size);
        })
    }

    pub fn record_error<E: fmt::Display + ?Sized>(
        &self,
        provider_id: &str,
        error: &E,
        response_time: Option<Duration>,
    ) -> LifecycleResult<()> {
        let message = sanitize_error_message(&error.to_string());
        self.update(provider_id, |record, window_size| {
            record.total_requests += 1;
            record.error_count += 1;
            record.last_error = Some(message);
            if let Some(response_time) = response_time {
                record.push_sample(response_time, window_size);
            }
        })
    }

    pub fn record_health(&self, provider_id: &str, healthy: bool) -> LifecycleResult<()> {
        self.update(provider_id, |record, _| {
            record.health_checks += 1;
            if !healthy {
                record.health_failures += 1;
            }
        })
    }

    pub fn get_metrics(&self, provider_id: &str) -> Option<MetricsSnapshot> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .map(|record| record.snapshot(provider_id))
    }

    /// Snapshots of every tracked provider, ordered by id
    pub fn all(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<MetricsSnapshot> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, record)| record.snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Zero the counters but keep tracking the provider
    pub fn reset(&self, provider_id: &str) {
        if let Some(record) = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(provider_id)
        {
            *record = MetricsRecord::new();
        }
    }

    pub fn remove(&self, provider_id: &str) -> Option<MetricsSnapshot> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id)
            .map(|record| record.snapshot(provider_id))
    }

    /// Publish one `metrics:updated` event per tracked provider every interval.
    ///
    /// Restarting replaces the previous publisher.
    pub fn start_updates(self: &Arc<Self>, bus: EventBus) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, metrics updates not started");
            return;
        };

        let weak = Arc::downgrade(self);
        let interval = self.config.update_interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it

            loop {
                ticker.tick().await;
                let Some(tracker) = weak.upgrade() else { break };
                let snapshots = tracker.all();
                debug!(providers = snapshots.len(), "Publishing metrics");
                for snapshot in snapshots {
                    bus.publish(LifecycleEvent::MetricsUpdated(snapshot));
                }
            }
        });

        let previous = self
            .updater
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Started metrics updates");
    }

    pub fn stop_updates(&self) {
        if let Some(handle) = self
            .updater
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("Stopped metrics updates");
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updater
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the publisher. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.stop_updates();
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl Drop for MetricsTracker {
    fn drop(&mut self) {
        if let Some(handle) = self
            .updater
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl fmt::Debug for MetricsTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsTracker")
            .field("config", &self.config)
            .field("updating", &self.is_updating())
            .finish()
    }
}
