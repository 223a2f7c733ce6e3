//! End-to-end lifecycle tests
//!
//! Tests drive the composition root the way an embedding application would:
//! register providers, run requests, watch events and shut down.


use provider_lifecycle::testing::{
    EventRecorder, MockProvider, RecordingSink, ScriptedHealthCheck, ScriptedSampler,
};
use provider_lifecycle::{
    ErrorKind, LifecycleError, LifecycleEvent, NotificationLevel, ProcessStatus,
    ProviderLifecycle, ProviderState, Topic,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    lifecycle: ProviderLifecycle,
    check: Arc<ScriptedHealthCheck>,
    sampler: Arc<ScriptedSampler>,
    sink: Arc<RecordingSink>,
}

fn harness() -> Harness {
    let check = Arc::new(ScriptedHealthCheck::healthy());
    let sampler = Arc::new(ScriptedSampler::new());
    let sink = Arc::new(RecordingSink::new());
    let lifecycle = ProviderLifecycle::builder(test_helpers::test_config())
        .health_check(check.clone())
        .process_sampler(sampler.clone())
        .notifier(sink.clone())
        .build()
        .unwrap();
    Harness {
        lifecycle,
        check,
        sampler,
        sink,
    }
}

#[tokio::test]
async fn test_register_execute_and_shutdown() {
    let h = harness();
    let provider = Arc::new(MockProvider::new("llm"));

    h.lifecycle.register(provider.clone()).await.unwrap();
    assert_eq!(
        h.lifecycle.get_current_state("llm"),
        Some(ProviderState::Connected)
    );
    assert!(h.lifecycle.health().is_monitoring("llm"));

    let answer = h
        .lifecycle
        .execute_metered("llm", |handle| async move {
            Ok((format!("hello from {}", handle.id()), Some(17)))
        })
        .await
        .unwrap();
    assert_eq!(answer, "hello from llm");

    let metrics = h.lifecycle.get_metrics("llm").unwrap();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.success_count, 1);
    assert_eq!(metrics.token_usage, Some(17));
    assert_eq!(metrics.samples, 1);

    h.lifecycle.shutdown().await;

    assert!(provider.is_disposed());
    assert_eq!(
        h.lifecycle.get_current_state("llm"),
        Some(ProviderState::Disconnected)
    );
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn test_nested_executes_fork_a_second_session() {
    let h = harness();
    let provider = Arc::new(MockProvider::new("llm"));
    h.lifecycle.register(provider.clone()).await.unwrap();

    let outer = h.lifecycle.acquire("llm").await.unwrap();
    let inner = h.lifecycle.acquire("llm").await.unwrap();
    assert_ne!(outer, inner);
    assert_eq!(provider.forks().len(), 1);

    let exhausted = h.lifecycle.acquire("llm").await.unwrap_err();
    assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);

    h.lifecycle.release("llm", &inner).await;
    h.lifecycle.release("llm", &outer).await;
    let stats = h.lifecycle.pool_stats("llm").await.unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 2);

    h.lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_permanent_connect_failure_is_reported_once() {
    let h = harness();
    let recorder = EventRecorder::attach(h.lifecycle.bus(), &[Topic::StateChange]);
    let provider = Arc::new(MockProvider::new("broken"));
    provider.fail_connects_permanently();

    let err = h.lifecycle.register(provider.clone()).await.unwrap_err();

    assert!(matches!(err, LifecycleError::Internal { .. }));
    assert_eq!(provider.connect_calls(), 1);

    let states: Vec<ProviderState> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LifecycleEvent::StateChange(transition) => Some(transition.new_state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![ProviderState::Connecting, ProviderState::Error]);

    let notifications = h.sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].level, NotificationLevel::Error);
    assert_eq!(notifications[0].title, "Provider connection failed");

    h.lifecycle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_escalates_through_lifecycle_wiring() {
    let h = harness();
    let criticals = Arc::new(AtomicUsize::new(0));
    {
        let criticals = criticals.clone();
        h.lifecycle.subscribe(Topic::HealthCritical, move |_| {
            criticals.fetch_add(1, Ordering::SeqCst);
        });
    }

    h.lifecycle
        .register(Arc::new(MockProvider::new("llm")))
        .await
        .unwrap();
    h.check.set_failure(Some("upstream unavailable"));

    // Checks run at 60s, 120s and 180s
    tokio::time::sleep(Duration::from_secs(181)).await;

    assert_eq!(h.check.calls(), 3);
    assert_eq!(criticals.load(Ordering::SeqCst), 1);
    let record = h.lifecycle.get_health("llm").unwrap();
    assert!(record.critical);
    assert_eq!(record.error_count, 3);

    let metrics = h.lifecycle.get_metrics("llm").unwrap();
    assert_eq!(metrics.health_checks, 3);
    assert_eq!(metrics.health_failures, 3);

    h.lifecycle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_process_monitoring_escalates_and_stops() {
    let h = harness();
    let pid = 4242;
    h.sampler.set(pid, 97.0, 40.0);

    h.lifecycle.monitor_process(pid).unwrap();
    // Samples at 5s, 10s and 15s
    tokio::time::sleep(Duration::from_millis(15_500)).await;

    let health = h.lifecycle.get_process_health(pid).unwrap();
    assert_eq!(health.status, ProcessStatus::Critical);
    assert_eq!(health.warnings, 3);
    let levels: Vec<NotificationLevel> =
        h.sink.notifications().iter().map(|n| n.level).collect();
    assert_eq!(
        levels,
        vec![
            NotificationLevel::Warning,
            NotificationLevel::Warning,
            NotificationLevel::Critical
        ]
    );

    h.lifecycle.stop_process_monitoring(pid);
    assert!(h.lifecycle.get_process_health(pid).is_none());
    assert!(!h.lifecycle.process_monitor().is_monitoring(pid));

    h.lifecycle.shutdown().await;
    assert!(matches!(
        h.lifecycle.monitor_process(pid),
        Err(LifecycleError::Cancelled)
    ));
}

/// Lifecycle with the built-in ping health check
fn default_lifecycle() -> ProviderLifecycle {
    ProviderLifecycle::builder(test_helpers::test_config())
        .notifier(Arc::new(RecordingSink::new()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_default_health_check_never_pings_a_held_handle() {
    let lifecycle = default_lifecycle();
    let provider = Arc::new(MockProvider::new("llm"));
    let registered = lifecycle.register(provider.clone()).await.unwrap();

    let held = lifecycle.acquire("llm").await.unwrap();
    assert_eq!(held, registered);

    let record = lifecycle.health().check_now("llm").await;
    assert!(record.is_healthy);
    assert_eq!(provider.ping_calls(), 0, "The caller's handle must not be pinged");

    let ping_session = provider.forks()[0].clone();
    assert_eq!(ping_session.ping_calls(), 1);
    let stats = lifecycle.pool_stats("llm").await.unwrap();
    assert_eq!(stats.total, 1, "The ping session is not pooled");
    assert_eq!(stats.in_use, 1);

    lifecycle.release("llm", &held).await;
    lifecycle.shutdown().await;
    assert!(ping_session.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_default_health_check_survives_reaped_template() {
    let lifecycle = default_lifecycle();
    let provider = Arc::new(MockProvider::new("llm"));
    let template = lifecycle.register(provider.clone()).await.unwrap();
    assert!(lifecycle.health().check_now("llm").await.is_healthy);

    let first = lifecycle.acquire("llm").await.unwrap();
    let busy = lifecycle.acquire("llm").await.unwrap();
    assert_eq!(first, template);
    lifecycle.release("llm", &template).await;

    tokio::time::advance(Duration::from_secs(301)).await;
    lifecycle.pool().reap_idle().await;

    assert!(provider.is_disposed(), "The idle template should be reaped");
    assert_eq!(
        lifecycle.get_current_state("llm"),
        Some(ProviderState::Connected)
    );
    assert!(lifecycle.health().is_monitoring("llm"));

    for _ in 0..3 {
        let record = lifecycle.health().check_now("llm").await;
        assert!(record.is_healthy);
        assert!(!record.critical);
    }
    assert_eq!(provider.ping_calls(), 0);
    assert!(!provider.forks()[0].is_disposed());
    assert_eq!(provider.session_for(&busy).unwrap().ping_calls(), 0);

    lifecycle.release("llm", &busy).await;
    lifecycle.shutdown().await;
}
