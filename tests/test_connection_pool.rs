//! Connection pool behavior tests
//!
//! Capacity, slot reuse, idle reaping and disposal as seen by a caller.


use futures::future::join_all;
use provider_lifecycle::testing::{MockProvider, RecordingSink};
use provider_lifecycle::{ConnectionPool, ErrorKind, LifecycleError, ProviderHandle};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_capacity_two_exhausts_then_reuses_freed_slot() {
    let (pool, _provider, _template) = test_helpers::seeded_pool("p1", 2).await;

    let first = pool.acquire("p1").await.unwrap();
    let second = pool.acquire("p1").await.unwrap();
    assert_ne!(first, second, "Both handles must be distinct sessions");

    let third = pool.acquire("p1").await;
    assert!(matches!(
        third,
        Err(LifecycleError::PoolExhausted { max_size: 2, .. })
    ));

    pool.release("p1", &second).await;
    let again = pool.acquire("p1").await.unwrap();
    assert_eq!(again, second, "Freed slot should be handed out again");

    let stats = pool.stats("p1").await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.in_use, 2);
}

#[tokio::test]
async fn test_acquire_uninitialized_provider_never_returns_handle() {
    let pool = ConnectionPool::new(test_helpers::pool_config(2));

    let err = pool.acquire("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotInitialized);
}

#[tokio::test]
async fn test_acquire_without_template_fails() {
    let pool = ConnectionPool::new(test_helpers::pool_config(2));
    pool.initialize("p1", test_helpers::pool_config(2)).await;

    let err = pool.acquire("p1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateUnavailable);
}

#[tokio::test]
async fn test_concurrent_acquires_respect_capacity() {
    let (pool, provider, _template) = test_helpers::seeded_pool("p1", 4).await;

    let results = join_all((0..10).map(|_| pool.acquire("p1"))).await;

    let granted = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(LifecycleError::PoolExhausted { .. })))
        .count();
    assert_eq!(granted, 4);
    assert_eq!(exhausted, 6);
    assert_eq!(provider.forks().len(), 3);
    assert!(pool.stats("p1").await.unwrap().total <= 4);
}

#[tokio::test]
async fn test_forked_sessions_are_connected_before_use() {
    let (pool, provider, template) = test_helpers::seeded_pool("p1", 3).await;

    let first = pool.acquire("p1").await.unwrap();
    let second = pool.acquire("p1").await.unwrap();

    assert_eq!(first, template);
    let session = provider
        .session_for(&second)
        .expect("second handle should be a forked session");
    assert!(session.is_connected());
    assert_eq!(session.connect_calls(), 1);
}

#[tokio::test]
async fn test_release_after_dispose_is_noop() {
    let (pool, provider, _template) = test_helpers::seeded_pool("p1", 2).await;
    let handle = pool.acquire("p1").await.unwrap();

    pool.dispose_all().await;
    pool.release("p1", &handle).await;
    pool.release("unknown", &handle).await;

    assert!(provider.is_disposed());
    assert!(pool.stats("p1").await.is_none());
}

#[tokio::test]
async fn test_dispose_continues_past_failing_slots() {
    let sink = Arc::new(RecordingSink::new());
    let pool = ConnectionPool::new(test_helpers::pool_config(3)).with_notifier(sink.clone());
    pool.initialize("p1", test_helpers::pool_config(3)).await;

    let provider = Arc::new(MockProvider::new("p1").with_failing_disconnect());
    provider.connect_now();
    pool.seed("p1", ProviderHandle::new(provider.clone()))
        .await
        .unwrap();
    pool.acquire("p1").await.unwrap();
    pool.acquire("p1").await.unwrap();

    pool.dispose_all().await;

    assert!(provider.is_disposed());
    assert!(provider.forks().iter().all(|fork| fork.is_disposed()));
    assert_eq!(sink.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_slots_are_reaped_after_timeout() {
    let (pool, provider, template) = test_helpers::seeded_pool("p1", 2).await;
    let pool = Arc::new(pool);
    pool.start_reaper();

    let busy = pool.acquire("p1").await.unwrap();
    assert_eq!(busy, template);
    let idle = pool.acquire("p1").await.unwrap();
    pool.release("p1", &idle).await;

    tokio::time::sleep(Duration::from_secs(601)).await;

    let stats = pool.stats("p1").await.unwrap();
    assert_eq!(stats.total, 1, "Only the in-use slot should survive");
    assert_eq!(stats.in_use, 1);
    let session = provider.session_for(&idle).unwrap();
    assert!(session.is_disposed());
    assert!(!provider.is_disposed());

    pool.dispose_all().await;
    assert!(!pool.is_reaper_running());
}
