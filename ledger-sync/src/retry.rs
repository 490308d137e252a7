// Retry executor - bounded retries with fixed (or multiplied) delay for every
// external call made by the pipeline

use crate::error::{ErrorKind, Result, SyncError};
use crate::metrics::RETRY_ATTEMPTS_TOTAL;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What the executor does once the attempt ceiling is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Re-raise the last error (ledger writes, sync cycles)
    Propagate,
    /// Log and return an empty result (best-effort background work)
    Skip,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub policy: ExhaustionPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            policy: ExhaustionPolicy::Propagate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based),
    /// never above `max_delay`
    fn delay_after(&self, attempt: u32) -> Duration {
        let cap = self.config.max_delay.max(self.config.delay);
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.config.backoff_multiplier.powi(exponent).max(1.0);
        let secs = self.config.delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
    }

    /// Run `operation` until it succeeds, fails permanently, is cancelled, or
    /// the attempt ceiling is reached.
    ///
    /// On exhaustion the configured [`ExhaustionPolicy`] decides between
    /// returning the last error and returning `T::default()`. Non-transient
    /// errors and cancellation are always returned as errors.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Default,
    {
        match self.attempt(operation_name, operation).await {
            Ok(value) => Ok(value),
            Err(Failure::Exhausted(err)) if self.config.policy == ExhaustionPolicy::Skip => {
                error!(
                    operation = operation_name,
                    attempts = self.max_attempts(),
                    error = %err,
                    "Max retries reached, skipping operation"
                );
                Ok(T::default())
            }
            Err(failure) => Err(self.propagate(operation_name, failure)),
        }
    }

    /// Like [`execute`](Self::execute) but always returns the last error on
    /// exhaustion, whatever the policy. For operations with no meaningful
    /// empty result, such as opening a connection.
    pub async fn execute_strict<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.attempt(operation_name, operation)
            .await
            .map_err(|failure| self.propagate(operation_name, failure))
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    fn propagate(&self, operation_name: &str, failure: Failure) -> SyncError {
        match failure {
            Failure::Exhausted(err) => {
                error!(
                    operation = operation_name,
                    attempts = self.max_attempts(),
                    error = %err,
                    "Max retries reached, propagating error"
                );
                err
            }
            Failure::Aborted(err) => err,
        }
    }

    async fn attempt<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> std::result::Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Failure::Aborted(SyncError::Cancelled(
                    operation_name.to_string(),
                )));
            }

            attempt += 1;

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempt, max_attempts, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.kind() != ErrorKind::Transient {
                warn!(
                    operation = operation_name,
                    attempt,
                    kind = ?err.kind(),
                    error = %err,
                    "Non-retryable error"
                );
                return Err(Failure::Aborted(err));
            }

            RETRY_ATTEMPTS_TOTAL
                .with_label_values(&[operation_name])
                .inc();
            warn!(
                operation = operation_name,
                attempt,
                max_attempts,
                error = %err,
                "Retry {}/{} failed",
                attempt,
                max_attempts
            );

            if attempt >= max_attempts {
                return Err(Failure::Exhausted(err));
            }

            let delay = self.delay_after(attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(operation = operation_name, attempt, "Retry loop cancelled");
                    return Err(Failure::Aborted(SyncError::Cancelled(
                        operation_name.to_string(),
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Why the attempt loop gave up
enum Failure {
    /// Every attempt failed transiently
    Exhausted(SyncError),
    /// Non-retryable error or cancellation
    Aborted(SyncError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn executor(policy: ExhaustionPolicy, max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig {
                max_attempts,
                delay: Duration::from_millis(100),
                backoff_multiplier: 1.0,
                max_delay: Duration::from_secs(1),
                policy,
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_fixed_delay() {
        let exec = executor(ExhaustionPolicy::Propagate, 5);
        assert_eq!(exec.delay_after(1), Duration::from_millis(100));
        assert_eq!(exec.delay_after(4), Duration::from_millis(100));
    }

    #[test]
    fn test_multiplied_delay_is_capped() {
        let exec = RetryExecutor::new(
            RetryConfig {
                max_attempts: 10,
                delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
                max_delay: Duration::from_millis(500),
                policy: ExhaustionPolicy::Propagate,
            },
            CancellationToken::new(),
        );

        assert_eq!(exec.delay_after(1), Duration::from_millis(100));
        assert_eq!(exec.delay_after(2), Duration::from_millis(200));
        assert_eq!(exec.delay_after(3), Duration::from_millis(400));
        assert_eq!(exec.delay_after(8), Duration::from_millis(500));
    }

    #[test]
    fn test_huge_backoff_is_capped() {
        let exec = RetryExecutor::new(
            RetryConfig {
                max_attempts: 30,
                delay: Duration::from_millis(2000),
                backoff_multiplier: 10.0,
                max_delay: Duration::from_secs(30),
                policy: ExhaustionPolicy::Propagate,
            },
            CancellationToken::new(),
        );

        assert_eq!(exec.delay_after(2), Duration::from_secs(20));
        assert_eq!(exec.delay_after(3), Duration::from_secs(30));
        assert_eq!(exec.delay_after(29), Duration::from_secs(30));
        assert_eq!(exec.delay_after(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_infinite_multiplier_is_capped() {
        let exec = RetryExecutor::new(
            RetryConfig {
                max_attempts: 5,
                delay: Duration::from_secs(1),
                backoff_multiplier: f64::INFINITY,
                max_delay: Duration::from_secs(30),
                policy: ExhaustionPolicy::Propagate,
            },
            CancellationToken::new(),
        );

        assert_eq!(exec.delay_after(1), Duration::from_secs(1));
        assert_eq!(exec.delay_after(2), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_outage_with_steep_backoff_exhausts_cleanly() {
        let exec = RetryExecutor::new(
            RetryConfig {
                max_attempts: 30,
                delay: Duration::from_millis(2000),
                backoff_multiplier: 10.0,
                max_delay: Duration::from_secs(30),
                policy: ExhaustionPolicy::Propagate,
            },
            CancellationToken::new(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<i64> = exec
            .execute("outage", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Unavailable("down".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_execution_ignores_skip_policy() {
        let exec = executor(ExhaustionPolicy::Skip, 2);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<String> = exec
            .execute_strict("connect", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Unavailable("refused".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_execution_recovers_from_late_start() {
        let exec = executor(ExhaustionPolicy::Propagate, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = exec
            .execute_strict("connect", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::Unavailable("not up yet".to_string()))
                    } else {
                        Ok(std::time::Instant::now())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_propagates_after_exact_attempts() {
        let exec = executor(ExhaustionPolicy::Propagate, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<i64> = exec
            .execute("always_down", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Unavailable("down".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_skips_in_lenient_mode() {
        let exec = executor(ExhaustionPolicy::Skip, 4);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<Vec<i64>> = exec
            .execute("best_effort", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Unavailable("down".to_string()))
                }
            })
            .await;

        assert!(result.unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let exec = executor(ExhaustionPolicy::Propagate, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = exec
            .execute("flaky", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SyncError::Unavailable("blip".to_string()))
                    } else {
                        Ok(7_i64)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let exec = executor(ExhaustionPolicy::Skip, 5);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = exec
            .execute("validate", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Validation("bad payload".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let exec = executor(ExhaustionPolicy::Propagate, 5);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<i64> = exec
            .execute("append", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::ProviderNotFound(99))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::ProviderNotFound(99))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        let exec = RetryExecutor::new(
            RetryConfig {
                max_attempts: 100,
                delay: Duration::from_secs(10),
                backoff_multiplier: 1.0,
                max_delay: Duration::from_secs(10),
                policy: ExhaustionPolicy::Propagate,
            },
            cancel.clone(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let task = tokio::spawn(async move {
            exec.execute("stuck", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SyncError::Unavailable("down".to_string()))
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = RetryExecutor::new(RetryConfig::default(), cancel);

        let result: Result<()> = exec.execute("never", || async { Ok(()) }).await;
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
    }
}
