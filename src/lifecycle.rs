//! Composition root wiring the pool, retry, state, health and metrics together
//!
//! [`ProviderLifecycle`] owns one instance of every component. Registering a
//! provider connects it with retry, seeds its pool and announces it on the
//! bus; the health monitor reacts to that announcement on its own.

use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::events::{
    EventBus, LifecycleEvent, ProviderEvent, ProviderState, StateTransition, SubscriptionId,
    Topic,
};
use crate::health::{
    HealthCheck, HealthMonitor, HealthMonitorConfig, HealthRecord, PingHealthCheck,
    ProcessHealth, ProcessMonitor, ProcessMonitorConfig, ProcessSampler,
};
use crate::notify::{Notification, NotificationSink, TracingSink};
use crate::observability::metrics::{MetricsConfig, MetricsSnapshot, MetricsTracker};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::provider::{Provider, ProviderHandle};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::state::StateManager;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Builder for [`ProviderLifecycle`] when the defaults need replacing
pub struct LifecycleBuilder {
    config: LifecycleConfig,
    health_check: Option<Arc<dyn HealthCheck>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    sampler: Option<Arc<dyn ProcessSampler>>,
}

impl LifecycleBuilder {
    /// Health check used instead of pinging each provider over a session of its own
    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn process_sampler(mut self, sampler: Arc<dyn ProcessSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn build(self) -> LifecycleResult<ProviderLifecycle> {
        self.config.validate()?;
        let config = self.config;

        let bus = EventBus::new();
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingSink));
        let state = Arc::new(StateManager::with_history_limit(
            bus.clone(),
            config.state.history_limit,
        ));
        let retry = Arc::new(RetryExecutor::new(RetryConfig::from(&config.retry)));
        let metrics = Arc::new(MetricsTracker::new(MetricsConfig::from(&config.metrics)));

        let ping_check = Arc::new(PingHealthCheck::new());
        let check: Arc<dyn HealthCheck> = match self.health_check {
            Some(check) => check,
            None => ping_check.clone() as Arc<dyn HealthCheck>,
        };
        let health = Arc::new(
            HealthMonitor::new(HealthMonitorConfig::from(&config.health), bus.clone())
                .with_health_check(check)
                .with_metrics(metrics.clone())
                .with_notifier(notifier.clone()),
        );
        health.attach();

        let mut process =
            ProcessMonitor::new(ProcessMonitorConfig::from(&config.process), bus.clone())
                .with_notifier(notifier.clone());
        if let Some(sampler) = self.sampler {
            process = process.with_sampler(sampler);
        }

        let pool = Arc::new(
            ConnectionPool::new(PoolConfig::from(&config.pool))
                .with_retry(retry.clone())
                .with_event_sink(state.clone())
                .with_notifier(notifier.clone()),
        );

        info!(
            max_pool_size = config.pool.max_pool_size,
            health_interval_secs = config.health.interval_secs,
            "Provider lifecycle ready"
        );

        Ok(ProviderLifecycle {
            config,
            bus,
            state,
            retry,
            metrics,
            health,
            process: Arc::new(process),
            pool,
            ping_check,
            notifier,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// A pooled handle held for one `execute` call.
///
/// If the call's future is dropped before [`Lease::release`], the handle is
/// released from a spawned task instead.
struct Lease {
    pool: Arc<ConnectionPool>,
    provider_id: String,
    handle: Option<ProviderHandle>,
}

impl Lease {
    fn new(pool: Arc<ConnectionPool>, provider_id: &str, handle: ProviderHandle) -> Self {
        Self {
            pool,
            provider_id: provider_id.to_string(),
            handle: Some(handle),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = &self.handle {
            self.pool.release(&self.provider_id, handle).await;
        }
        self.handle = None;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(provider_id = %self.provider_id, "No async runtime, abandoned handle not released");
            return;
        };

        debug!(provider_id = %self.provider_id, "Execute abandoned, releasing its handle");
        let pool = self.pool.clone();
        let provider_id = std::mem::take(&mut self.provider_id);
        runtime.spawn(async move {
            pool.release(&provider_id, &handle).await;
        });
    }
}

/// Owns and wires every lifecycle component
pub struct ProviderLifecycle {
    config: LifecycleConfig,
    bus: EventBus,
    state: Arc<StateManager>,
    retry: Arc<RetryExecutor>,
    metrics: Arc<MetricsTracker>,
    health: Arc<HealthMonitor>,
    process: Arc<ProcessMonitor>,
    pool: Arc<ConnectionPool>,
    ping_check: Arc<PingHealthCheck>,
    notifier: Arc<dyn NotificationSink>,
    shut_down: AtomicBool,
}

impl ProviderLifecycle {
    pub fn new(config: LifecycleConfig) -> LifecycleResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: LifecycleConfig) -> LifecycleBuilder {
        LifecycleBuilder {
            config,
            health_check: None,
            notifier: None,
            sampler: None,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn process_monitor(&self) -> &Arc<ProcessMonitor> {
        &self.process
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn retry(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    fn ensure_running(&self) -> LifecycleResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(LifecycleError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn start_background_tasks(&self) {
        self.pool.start_reaper();
        if !self.metrics.is_updating() {
            self.metrics.start_updates(self.bus.clone());
        }
    }

    /// Connect `provider` and make it available for acquisition.
    ///
    /// Emits `connecting`, then `connected` once the handle is pooled. On
    /// failure emits `error` with the reason, records it and returns it.
    pub async fn register(&self, provider: Arc<dyn Provider>) -> LifecycleResult<ProviderHandle> {
        self.ensure_running()?;
        let provider_id = provider.id().to_string();
        let span = crate::provider_span!(operation = "register", provider_id = %provider_id);

        async {
            self.pool
                .initialize(&provider_id, PoolConfig::from(&self.config.pool))
                .await;
            self.metrics.initialize(&provider_id);
            self.start_background_tasks();

            self.state.emit_event(
                &provider_id,
                ProviderEvent::state_change(ProviderState::Connecting),
            );

            let handle = ProviderHandle::new(provider);
            let started = Instant::now();
            let connected = self
                .retry
                .run_classified(|| {
                    let handle = handle.clone();
                    async move { handle.connect().await }
                })
                .await;

            if let Err(e) = connected {
                self.fail_registration(&provider_id, &e, started);
                return Err(e);
            }

            if let Err(e) = self.pool.seed(&provider_id, handle.clone()).await {
                if let Err(cleanup) = handle.shutdown().await {
                    debug!(provider_id = %provider_id, error = %cleanup, "Cleanup after failed seed failed");
                }
                self.fail_registration(&provider_id, &e, started);
                return Err(e);
            }

            self.ping_check.register(handle.clone()).await;
            self.state.emit_event(
                &provider_id,
                ProviderEvent::state_change(ProviderState::Connected)
                    .with_reason("registered"),
            );
            info!(provider_id = %provider_id, "Provider registered");
            Ok(handle)
        }
        .instrument(span)
        .await
    }

    fn fail_registration(&self, provider_id: &str, error: &LifecycleError, started: Instant) {
        warn!(provider_id = %provider_id, error = %error, kind = %error.kind(), "Provider registration failed");
        self.state.emit_event(
            provider_id,
            ProviderEvent::state_change(ProviderState::Error).with_reason(error.sanitized_message()),
        );
        if let Err(e) = self
            .metrics
            .record_error(provider_id, error, Some(started.elapsed()))
        {
            debug!(provider_id = %provider_id, error = %e, "Registration failure not recorded");
        }
        self.notifier.notify(
            Notification::error("Provider connection failed", &error.to_string())
                .for_provider(provider_id)
                .with_context(serde_json::json!({ "kind": error.kind().as_str() })),
        );
    }

    pub async fn acquire(&self, provider_id: &str) -> LifecycleResult<ProviderHandle> {
        self.ensure_running()?;
        self.pool.acquire(provider_id).await
    }

    pub async fn release(&self, provider_id: &str, handle: &ProviderHandle) {
        self.pool.release(provider_id, handle).await;
    }

    /// Run `operation` on a pooled handle, recording its outcome in metrics.
    ///
    /// The handle is released whatever the outcome, and also when the
    /// returned future is dropped before completing.
    pub async fn execute<T, F, Fut>(&self, provider_id: &str, operation: F) -> LifecycleResult<T>
    where
        F: FnOnce(ProviderHandle) -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
    {
        self.execute_metered(provider_id, |handle| async move {
            operation(handle).await.map(|value| (value, None))
        })
        .await
    }

    /// Like [`execute`](Self::execute), for operations that report token usage
    pub async fn execute_metered<T, F, Fut>(
        &self,
        provider_id: &str,
        operation: F,
    ) -> LifecycleResult<T>
    where
        F: FnOnce(ProviderHandle) -> Fut,
        Fut: Future<Output = LifecycleResult<(T, Option<u64>)>>,
    {
        let handle = self.acquire(provider_id).await?;
        let lease = Lease::new(self.pool.clone(), provider_id, handle.clone());
        let span = crate::pool_span!(operation = "execute", provider_id = %provider_id);

        let started = Instant::now();
        let result = operation(handle).instrument(span).await;
        let elapsed = started.elapsed();

        let recorded = match &result {
            Ok((_, tokens)) => self.metrics.record_success(provider_id, elapsed, *tokens),
            Err(e) => self.metrics.record_error(provider_id, e, Some(elapsed)),
        };
        if let Err(e) = recorded {
            debug!(provider_id = %provider_id, error = %e, "Request outcome not recorded");
        }

        lease.release().await;
        result.map(|(value, _)| value)
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.state.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub fn get_current_state(&self, provider_id: &str) -> Option<ProviderState> {
        self.state.get_current_state(provider_id)
    }

    pub fn get_state_history(&self, provider_id: &str) -> Vec<StateTransition> {
        self.state.get_state_history(provider_id)
    }

    pub fn get_health(&self, provider_id: &str) -> Option<HealthRecord> {
        self.health.get_health(provider_id)
    }

    pub fn get_metrics(&self, provider_id: &str) -> Option<MetricsSnapshot> {
        self.metrics.get_metrics(provider_id)
    }

    pub async fn pool_stats(&self, provider_id: &str) -> Option<PoolStats> {
        self.pool.stats(provider_id).await
    }

    /// Watch CPU and memory of the process hosting a local provider
    pub fn monitor_process(&self, pid: u32) -> LifecycleResult<()> {
        self.ensure_running()?;
        self.process.start(pid);
        Ok(())
    }

    pub fn stop_process_monitoring(&self, pid: u32) {
        self.process.stop(pid);
    }

    pub fn get_process_health(&self, pid: u32) -> Option<ProcessHealth> {
        self.process.get_health(pid)
    }

    /// Stop every loop and shut down every pooled connection. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down provider lifecycle");
        self.retry.dispose();
        self.health.dispose();
        self.process.stop_all();
        self.metrics.dispose();
        self.ping_check.dispose().await;
        self.pool.dispose_all().await;
        info!("Provider lifecycle shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProviderLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLifecycle")
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
