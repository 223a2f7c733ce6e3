//! Mock implementations for testing
//!
//! Provides a scriptable provider, notification and event recorders, and
//! scripted health checks and process samplers, so the lifecycle engine can be
//! exercised without real backends or processes.

use crate::error::{LifecycleError, LifecycleResult};
use crate::events::{EventBus, LifecycleEvent, Topic};
use crate::health::{HealthCheck, HealthCheckResult, ProcessSample, ProcessSampler};
use crate::notify::{Notification, NotificationSink};
use crate::provider::{Provider, ProviderHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct MockBehavior {
    connect_failures: AtomicU32,
    permanent_connect_failure: AtomicBool,
    fail_disconnect: AtomicBool,
    hang_connect: AtomicBool,
    fail_ping: AtomicBool,
    ping_latency: Mutex<Duration>,
    forks: Mutex<Vec<Arc<MockProvider>>>,
    next_session: AtomicUsize,
}

/// Mock provider for testing.
///
/// Behaviour switches are shared by every session forked from the same root,
/// and every fork is kept in a registry reachable through [`MockProvider::forks`].
#[derive(Debug)]
pub struct MockProvider {
    id: String,
    session: usize,
    connected: AtomicBool,
    disposed: AtomicBool,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    ping_calls: AtomicU32,
    behavior: Arc<MockBehavior>,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self::session_of(id.into(), 0, Arc::new(MockBehavior::default()))
    }

    fn session_of(id: String, session: usize, behavior: Arc<MockBehavior>) -> Self {
        Self {
            id,
            session,
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            ping_calls: AtomicU32::new(0),
            behavior,
        }
    }

    pub fn with_failing_disconnect(self) -> Self {
        self.behavior.fail_disconnect.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_ping_latency(self, latency: Duration) -> Self {
        *lock(&self.behavior.ping_latency) = latency;
        self
    }

    /// The next `count` connects, on any session, fail with a transient error
    pub fn fail_next_connects(&self, count: u32) {
        self.behavior.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Every connect fails with a permanent error
    pub fn fail_connects_permanently(&self) {
        self.behavior
            .permanent_connect_failure
            .store(true, Ordering::SeqCst);
    }

    /// While set, connects on any session never complete
    pub fn set_connect_hanging(&self, hanging: bool) {
        self.behavior.hang_connect.store(hanging, Ordering::SeqCst);
    }

    pub fn set_ping_failing(&self, failing: bool) {
        self.behavior.fail_ping.store(failing, Ordering::SeqCst);
    }

    /// Mark this session connected without going through `connect`
    pub fn connect_now(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Pings received by this session only
    pub fn ping_calls(&self) -> u32 {
        self.ping_calls.load(Ordering::SeqCst)
    }

    /// 0 for the root session, then 1, 2, ... in fork order
    pub fn session(&self) -> usize {
        self.session
    }

    /// Every session forked from this provider's root, in creation order
    pub fn forks(&self) -> Vec<Arc<MockProvider>> {
        lock(&self.behavior.forks).clone()
    }

    /// The forked session behind `handle`, if it is one
    pub fn session_for(&self, handle: &ProviderHandle) -> Option<Arc<MockProvider>> {
        let target = Arc::as_ptr(handle.provider()).cast::<()>();
        self.forks()
            .into_iter()
            .find(|fork| Arc::as_ptr(fork).cast::<()>() == target)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), LifecycleError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        if self.behavior.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if self.behavior.permanent_connect_failure.load(Ordering::SeqCst) {
            return Err(LifecycleError::internal("mock credentials rejected"));
        }
        let transient = self
            .behavior
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(LifecycleError::connection_failed("mock connection refused"));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LifecycleError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.behavior.fail_disconnect.load(Ordering::SeqCst) {
            Err(LifecycleError::connection_failed("mock disconnect failed"))
        } else {
            Ok(())
        }
    }

    async fn ping(&self) -> Result<Duration, LifecycleError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);

        if self.is_disposed() || !self.is_connected() {
            Err(LifecycleError::connection_failed("mock session is closed"))
        } else if self.behavior.fail_ping.load(Ordering::SeqCst) {
            Err(LifecycleError::timeout("mock ping timed out"))
        } else {
            Ok(*lock(&self.behavior.ping_latency))
        }
    }

    async fn dispose(&self) -> Result<(), LifecycleError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn fork(&self) -> Arc<dyn Provider> {
        let session = self.behavior.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let fork = Arc::new(MockProvider::session_of(
            self.id.clone(),
            session,
            self.behavior.clone(),
        ));
        lock(&self.behavior.forks).push(fork.clone());
        fork
    }
}

/// Notification sink that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.received).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.received).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        lock(&self.received).push(notification);
    }
}

/// Health check whose outcome is set by the test
#[derive(Debug, Default)]
pub struct ScriptedHealthCheck {
    failure: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    calls: AtomicU32,
}

impl ScriptedHealthCheck {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing(error: impl Into<String>) -> Self {
        let check = Self::default();
        *lock(&check.failure) = Some(error.into());
        check
    }

    pub fn set_failure(&self, error: Option<&str>) {
        *lock(&self.failure) = error.map(str::to_string);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealthCheck {
    async fn check(&self, _provider_id: &str) -> Result<HealthCheckResult, LifecycleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = lock(&self.failure).clone();
        Ok(match failure {
            Some(error) => HealthCheckResult::unhealthy(error),
            None => HealthCheckResult::healthy(*lock(&self.latency)),
        })
    }
}

/// Process sampler serving readings set by the test
#[derive(Debug, Default)]
pub struct ScriptedSampler {
    readings: Mutex<HashMap<u32, ProcessSample>>,
}

impl ScriptedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: u32, cpu_percent: f32, memory_percent: f32) {
        lock(&self.readings).insert(
            pid,
            ProcessSample {
                cpu_percent,
                memory_percent,
            },
        );
    }

    /// Make `pid` look like it exited
    pub fn remove(&self, pid: u32) {
        lock(&self.readings).remove(&pid);
    }
}

impl ProcessSampler for ScriptedSampler {
    fn sample(&self, pid: u32) -> LifecycleResult<ProcessSample> {
        lock(&self.readings)
            .get(&pid)
            .copied()
            .ok_or_else(|| LifecycleError::internal(format!("process {pid} not found")))
    }
}

/// Records every event published on the topics it was attached to
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus, topics: &[Topic]) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        for topic in topics {
            let sink = recorder.clone();
            bus.subscribe(*topic, move |event| {
                lock(&sink.events).push(event.clone());
            });
        }
        recorder
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, topic: Topic) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.topic() == topic)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}
