//! Bounded exponential-backoff retry for arbitrary async operations
//!
//! The executor itself retries every failure. Callers that only want transient
//! failures retried use [`RetryExecutor::run_classified`], which consults the
//! shared error classifier.

use crate::error::{LifecycleError, LifecycleResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts before the final error is returned
    pub max_retries: u32,
    /// Delay after the first failure; doubled after each further failure
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }
}

fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base_delay.saturating_mul(1u32 << exponent)
}

/// Runs operations with retry. Disposal cancels any pending backoff wait.
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry every failure using the configured policy
    pub async fn run<T, F, Fut>(&self, operation: F) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
    {
        self.execute(
            operation,
            self.config.max_retries,
            self.config.base_delay,
            |_| true,
        )
        .await
    }

    /// Retry every failure with an explicit bound and base delay
    pub async fn run_with<T, F, Fut>(
        &self,
        operation: F,
        max_retries: u32,
        base_delay: Duration,
    ) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
    {
        self.execute(operation, max_retries, base_delay, |_| true)
            .await
    }

    /// Retry only failures the classifier marks as transient
    pub async fn run_classified<T, F, Fut>(&self, operation: F) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
    {
        self.execute(
            operation,
            self.config.max_retries,
            self.config.base_delay,
            LifecycleError::is_retryable,
        )
        .await
    }

    async fn execute<T, F, Fut, P>(
        &self,
        mut operation: F,
        max_retries: u32,
        base_delay: Duration,
        should_retry: P,
    ) -> LifecycleResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LifecycleResult<T>>,
        P: Fn(&LifecycleError) -> bool,
    {
        let max_attempts = max_retries.max(1);
        let mut attempt = 0;

        loop {
            if self.is_disposed() {
                return Err(LifecycleError::Cancelled);
            }

            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= max_attempts || !should_retry(&e) => {
                    debug!(attempt, error = %e, kind = %e.kind(), "Giving up on operation");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff_delay(base_delay, attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    if !self.interruptible_sleep(delay).await {
                        return Err(LifecycleError::Cancelled);
                    }
                }
            }
        }
    }

    /// Returns true if the sleep completed, false if disposal interrupted it
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return false;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Retry executor disposed during backoff, cancelling");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Cancel pending waits and refuse further runs. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_saturates() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(200), Duration::from_millis(1000) * (1u32 << 31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let executor = RetryExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = calls.clone();
        let result = executor
            .run_with(
                move || {
                    let counter = counter.clone();
                    async move {
                        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if call < 3 {
                            Err(LifecycleError::connection_failed("refused"))
                        } else {
                            Ok("ready")
                        }
                    }
                },
                3,
                Duration::from_millis(100),
            )
            .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_unchanged() {
        let executor = RetryExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: LifecycleResult<()> = executor
            .run_with(
                move || {
                    let counter = counter.clone();
                    async move {
                        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Err(LifecycleError::timeout(format!("attempt {call}")))
                    }
                },
                3,
                Duration::from_millis(10),
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { ref message } if message == "attempt 3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_run_skips_permanent_errors() {
        let executor = RetryExecutor::default();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: LifecycleResult<()> = executor
            .run_classified(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LifecycleError::internal("bad credentials"))
                }
            })
            .await;

        assert!(matches!(result, Err(LifecycleError::Internal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_wait() {
        let executor = Arc::new(RetryExecutor::new(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
        }));

        let runner = executor.clone();
        let handle = tokio::spawn(async move {
            runner
                .run(|| async { Err::<(), _>(LifecycleError::connection_failed("down")) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        let start = Instant::now();
        executor.dispose();
        executor.dispose();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LifecycleError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_disposed_executor_refuses_to_run() {
        let executor = RetryExecutor::default();
        executor.dispose();
        assert!(executor.is_disposed());

        let result = executor.run(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(LifecycleError::Cancelled)));
    }
}
