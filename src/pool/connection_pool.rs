//! Pool engine: acquire, release, idle reaping and disposal

use super::{ConnectionSlot, PoolConfig, PoolStats};
use crate::error::{LifecycleError, LifecycleResult};
use crate::events::{EventSink, ProviderEvent, ProviderState};
use crate::notify::{Notification, NotificationSink, TracingSink};
use crate::provider::ProviderHandle;
use crate::retry::RetryExecutor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ProviderPool {
    config: PoolConfig,
    slots: Vec<ConnectionSlot>,
    /// Forks still connecting. Only incremented under the pool lock.
    pending: Arc<AtomicUsize>,
}

impl ProviderPool {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn occupied(&self) -> usize {
        self.slots.len() + self.pending()
    }

    fn stats(&self) -> PoolStats {
        let in_use = self.slots.iter().filter(|slot| slot.in_use).count();
        PoolStats {
            total: self.slots.len(),
            in_use,
            idle: self.slots.len() - in_use,
            pending: self.pending(),
            max_size: self.config.max_pool_size,
        }
    }
}

/// Capacity held for a fork while it connects outside the pool lock.
///
/// Dropping the reservation returns the capacity. If `acquire` is cancelled
/// before [`Reservation::complete`], the unfinished session is shut down too.
struct Reservation {
    provider_id: String,
    pending: Arc<AtomicUsize>,
    session: Option<ProviderHandle>,
}

impl Reservation {
    fn new(provider_id: &str, pool: &ProviderPool) -> Self {
        pool.pending.fetch_add(1, Ordering::SeqCst);
        Self {
            provider_id: provider_id.to_string(),
            pending: pool.pending.clone(),
            session: None,
        }
    }

    fn track(&mut self, session: ProviderHandle) {
        self.session = Some(session);
    }

    /// The caller now owns the session; only the capacity is handed back
    fn complete(mut self) {
        self.session = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let Some(session) = self.session.take() else {
            return;
        };
        let provider_id = std::mem::take(&mut self.provider_id);
        debug!(provider_id = %provider_id, "Slot connect abandoned, shutting the session down");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.shutdown().await {
                        debug!(provider_id = %provider_id, error = %e, "Cleanup of abandoned slot failed");
                    }
                });
            }
            Err(_) => {
                warn!(provider_id = %provider_id, "No async runtime, abandoned slot not shut down");
            }
        }
    }
}

type SharedPool = Arc<Mutex<ProviderPool>>;

/// Connection pools for every registered provider.
///
/// Each provider's slot list sits behind its own lock, so providers never
/// contend with each other. Provider I/O (connect, disconnect, dispose) always
/// happens outside that lock.
pub struct ConnectionPool {
    default_config: PoolConfig,
    pools: RwLock<HashMap<String, SharedPool>>,
    retry: Option<Arc<RetryExecutor>>,
    events: Option<Arc<dyn EventSink>>,
    notifier: Arc<dyn NotificationSink>,
    shutdown_tx: watch::Sender<bool>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(default_config: PoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            default_config,
            pools: RwLock::new(HashMap::new()),
            retry: None,
            events: None,
            notifier: Arc::new(TracingSink),
            shutdown_tx,
            reaper: std::sync::Mutex::new(None),
        }
    }

    /// Wrap connects of forked sessions in `retry`, retrying transient failures only
    pub fn with_retry(mut self, retry: Arc<RetryExecutor>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn default_config(&self) -> &PoolConfig {
        &self.default_config
    }

    /// Register an empty pool. Does nothing if the provider already has one.
    pub async fn initialize(&self, provider_id: &str, config: PoolConfig) {
        let mut pools = self.pools.write().await;
        if pools.contains_key(provider_id) {
            debug!(provider_id = %provider_id, "Pool already initialized");
            return;
        }

        info!(
            provider_id = %provider_id,
            max_pool_size = config.max_pool_size,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Initialized connection pool"
        );
        pools.insert(
            provider_id.to_string(),
            Arc::new(Mutex::new(ProviderPool::new(config))),
        );
    }

    pub async fn contains(&self, provider_id: &str) -> bool {
        self.pools.read().await.contains_key(provider_id)
    }

    async fn pool(&self, provider_id: &str) -> Option<SharedPool> {
        self.pools.read().await.get(provider_id).cloned()
    }

    async fn is_registered(&self, provider_id: &str, pool: &SharedPool) -> bool {
        self.pools
            .read()
            .await
            .get(provider_id)
            .is_some_and(|current| Arc::ptr_eq(current, pool))
    }

    /// Add an already connected handle as a free slot.
    ///
    /// The first seeded handle becomes the template for forks. Seeding a
    /// handle that is already pooled does nothing.
    pub async fn seed(&self, provider_id: &str, handle: ProviderHandle) -> LifecycleResult<()> {
        let pool = self
            .pool(provider_id)
            .await
            .ok_or_else(|| LifecycleError::not_initialized(provider_id))?;
        let mut pool = pool.lock().await;

        if pool.slots.iter().any(|slot| slot.handle.same_session(&handle)) {
            return Ok(());
        }
        if pool.occupied() >= pool.config.max_pool_size {
            return Err(LifecycleError::pool_exhausted(
                provider_id,
                pool.config.max_pool_size,
            ));
        }

        pool.slots.push(ConnectionSlot::new(handle, false));
        debug!(provider_id = %provider_id, slots = pool.slots.len(), "Seeded pool");
        Ok(())
    }

    /// Hand out a free slot, or fork the template into a new one.
    ///
    /// Never waits for a slot to free up: a full pool fails with
    /// [`LifecycleError::PoolExhausted`].
    pub async fn acquire(&self, provider_id: &str) -> LifecycleResult<ProviderHandle> {
        let shared = self
            .pool(provider_id)
            .await
            .ok_or_else(|| LifecycleError::not_initialized(provider_id))?;

        let (template, mut reservation) = {
            let mut pool = shared.lock().await;

            if let Some(slot) = pool.slots.iter_mut().find(|slot| !slot.in_use) {
                slot.in_use = true;
                slot.last_used_at = Instant::now();
                debug!(provider_id = %provider_id, "Reusing free slot");
                return Ok(slot.handle.clone());
            }

            let template = pool
                .slots
                .first()
                .map(|slot| slot.handle.clone())
                .ok_or_else(|| LifecycleError::template_unavailable(provider_id))?;

            if pool.occupied() >= pool.config.max_pool_size {
                return Err(LifecycleError::pool_exhausted(
                    provider_id,
                    pool.config.max_pool_size,
                ));
            }

            (template, Reservation::new(provider_id, &pool))
        };

        let handle = template.fork();
        reservation.track(handle.clone());
        let connected = self.connect(&handle).await;

        let mut pool = shared.lock().await;
        // The pool may have been disposed while the fork was connecting
        let registered = self.is_registered(provider_id, &shared).await;
        reservation.complete();

        if let Err(e) = connected {
            drop(pool);
            warn!(provider_id = %provider_id, error = %e, "Failed to connect new slot");
            if let Err(cleanup) = handle.shutdown().await {
                debug!(provider_id = %provider_id, error = %cleanup, "Cleanup of unconnected slot failed");
            }
            return Err(e);
        }

        if !registered {
            drop(pool);
            self.shutdown_handle(provider_id, &handle).await;
            return Err(LifecycleError::not_initialized(provider_id));
        }

        pool.slots.push(ConnectionSlot::new(handle.clone(), true));
        let slots = pool.slots.len();
        drop(pool);

        info!(provider_id = %provider_id, slots, "Created pool slot");
        self.emit(
            provider_id,
            ProviderEvent::state_change(ProviderState::Connected).with_reason("pool slot created"),
        );
        Ok(handle)
    }

    async fn connect(&self, handle: &ProviderHandle) -> LifecycleResult<()> {
        match &self.retry {
            Some(retry) => {
                retry
                    .run_classified(|| {
                        let handle = handle.clone();
                        async move { handle.connect().await }
                    })
                    .await
            }
            None => handle.connect().await,
        }
    }

    /// Return a slot to the pool. Unknown providers and handles are ignored.
    pub async fn release(&self, provider_id: &str, handle: &ProviderHandle) {
        let Some(pool) = self.pool(provider_id).await else {
            debug!(provider_id = %provider_id, "Release for unknown pool ignored");
            return;
        };
        let mut pool = pool.lock().await;

        match pool
            .slots
            .iter_mut()
            .find(|slot| slot.handle.same_session(handle))
        {
            Some(slot) => {
                slot.in_use = false;
                slot.last_used_at = Instant::now();
            }
            None => debug!(provider_id = %provider_id, "Release for unknown slot ignored"),
        }
    }

    pub async fn stats(&self, provider_id: &str) -> Option<PoolStats> {
        let pool = self.pool(provider_id).await?;
        let stats = pool.lock().await.stats();
        Some(stats)
    }

    /// One sweep over every pool, removing free slots idle past their timeout.
    ///
    /// Returns the number of slots reaped. Busy slots are never touched.
    pub async fn reap_idle(&self) -> usize {
        let pools: Vec<(String, SharedPool)> = self
            .pools
            .read()
            .await
            .iter()
            .map(|(id, pool)| (id.clone(), pool.clone()))
            .collect();

        let mut reaped = 0;
        for (provider_id, shared) in pools {
            let (expired, emptied) = {
                let mut pool = shared.lock().await;
                let timeout = pool.config.idle_timeout;
                let had_slots = !pool.slots.is_empty();
                let (expired, kept): (Vec<_>, Vec<_>) = pool
                    .slots
                    .drain(..)
                    .partition(|slot| slot.is_idle_past(timeout));
                pool.slots = kept;
                (expired, had_slots && pool.slots.is_empty())
            };

            if expired.is_empty() {
                continue;
            }

            debug!(provider_id = %provider_id, count = expired.len(), "Reaping idle slots");
            for slot in &expired {
                self.shutdown_handle(&provider_id, &slot.handle).await;
            }
            reaped += expired.len();

            if emptied {
                self.emit(
                    &provider_id,
                    ProviderEvent::state_change(ProviderState::Disconnected)
                        .with_reason("idle timeout"),
                );
            }
        }

        reaped
    }

    async fn reap_interval(&self) -> Duration {
        let pools: Vec<SharedPool> = self.pools.read().await.values().cloned().collect();
        let mut interval = self.default_config.idle_timeout;
        for pool in pools {
            interval = interval.min(pool.lock().await.config.idle_timeout);
        }
        interval
    }

    /// Start the periodic idle reaper. Calling it while one runs does nothing.
    pub fn start_reaper(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, idle reaper not started");
            return;
        };

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let weak = Arc::downgrade(self);

        *reaper = Some(runtime.spawn(async move {
            info!("Idle reaper started");
            loop {
                let interval = match weak.upgrade() {
                    Some(pool) => pool.reap_interval().await,
                    None => break,
                };

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(pool) = weak.upgrade() else { break };
                let reaped = pool.reap_idle().await;
                if reaped > 0 {
                    info!(reaped, "Reaped idle pool slots");
                }
            }
            info!("Idle reaper stopped");
        }));
    }

    pub fn is_reaper_running(&self) -> bool {
        self.reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn stop_reaper(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Stop the reaper, shut down every slot and forget every pool.
    ///
    /// Per-slot shutdown failures are logged and notified, never returned.
    /// Calling this again is harmless.
    pub async fn dispose_all(&self) {
        self.stop_reaper();

        let pools: Vec<(String, SharedPool)> = self.pools.write().await.drain().collect();
        if pools.is_empty() {
            return;
        }

        let mut disposed = 0;
        for (provider_id, shared) in pools {
            let slots = std::mem::take(&mut shared.lock().await.slots);
            if slots.is_empty() {
                continue;
            }

            for slot in &slots {
                self.shutdown_handle(&provider_id, &slot.handle).await;
            }
            disposed += slots.len();

            self.emit(
                &provider_id,
                ProviderEvent::state_change(ProviderState::Disconnected)
                    .with_reason("pool disposed"),
            );
        }

        info!(slots = disposed, "Disposed all connection pools");
    }

    async fn shutdown_handle(&self, provider_id: &str, handle: &ProviderHandle) {
        if let Err(e) = handle.shutdown().await {
            warn!(provider_id = %provider_id, error = %e, "Suppressed slot shutdown error");
            self.notifier.notify(
                Notification::warning("Connection shutdown failed", &e.to_string())
                    .for_provider(provider_id),
            );
        }
    }

    fn emit(&self, provider_id: &str, event: ProviderEvent) {
        if let Some(events) = &self.events {
            events.emit_event(provider_id, event);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("default_config", &self.default_config)
            .field("retry", &self.retry.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}
