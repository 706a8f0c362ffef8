//! Retry with exponential backoff for transient backend failures.
//!
//! Only errors for which [`MemoryError::is_retryable`] holds are retried.
//! Waits between attempts race the context's cancellation token.

use crate::context::MemoryContext;
use crate::error::{MemoryError, Result};
use agentkit_common::RetryConfig;
use std::future::Future;
use std::time::Duration;

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles with each retry).
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(max_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out.
///
/// `f` must be safe to re-run: every attempt either commits fully or not at
/// all.
pub async fn with_retry<T, F, Fut>(
    ctx: &MemoryContext,
    operation: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match f().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation, attempt = attempt + 1, "Backend recovered after retries");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if attempt + 1 >= max_attempts {
            tracing::error!(operation, attempts = max_attempts, error = %err, "Retries exhausted");
            return Err(MemoryError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: max_attempts,
                last_error: err.to_string(),
            });
        }

        let delay = policy.backoff_delay(attempt);
        tracing::warn!(
            operation,
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient backend error, retrying"
        );

        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(MemoryError::Cancelled {
                    operation: operation.to_string(),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = MemoryContext::new();

        let counter = calls.clone();
        let result = with_retry(&ctx, "store memory", &fast_policy(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(MemoryError::backend("store memory", "connection refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = MemoryContext::new();

        let counter = calls.clone();
        let result: Result<()> = with_retry(&ctx, "store memory", &fast_policy(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::backend("store memory", "permission denied for table"))
            }
        })
        .await;

        assert!(matches!(result, Err(MemoryError::Backend { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_operation_and_attempts() {
        let ctx = MemoryContext::new();
        let result: Result<()> = with_retry(&ctx, "create tables", &fast_policy(), || async {
            Err(MemoryError::backend("create tables", "server is not ready"))
        })
        .await;

        match result {
            Err(MemoryError::RetriesExhausted {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "create tables");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_during_backoff_is_distinct() {
        let ctx = MemoryContext::new();
        ctx.cancellation_token().cancel();

        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&ctx, "batch store", &policy, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::backend("batch store", "connection reset by peer"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
