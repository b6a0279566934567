use crate::error::{JobError, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    None,
    Linear { max_attempts: u32, delay_ms: u64 },
    Exponential { max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64 },
}

impl RetryStrategy {
    fn max_attempts(&self) -> u32 {
        match self {
            RetryStrategy::None => 1,
            RetryStrategy::Linear { max_attempts, .. } => (*max_attempts).max(1),
            RetryStrategy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Linear { delay_ms, .. } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential { base_delay_ms, max_delay_ms, .. } => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                Duration::from_millis(base_delay_ms.saturating_mul(factor).min(*max_delay_ms))
            }
        }
    }
}

/// Retry executor for handling recoverable operations
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// Execute an operation, retrying only errors that report `is_recoverable()`
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.strategy.max_attempts();
        let mut attempt = 1;

        loop {
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    let delay = self.strategy.delay_after(attempt);
                    warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err, delay.as_millis());
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub async fn retry_with_linear_backoff<F, Fut, T>(
    operation: F,
    max_attempts: u32,
    delay_ms: u64,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    RetryExecutor::new(RetryStrategy::Linear { max_attempts, delay_ms })
        .execute(operation)
        .await
}

pub async fn retry_with_exponential_backoff<F, Fut, T>(
    operation: F,
    max_attempts: u32,
    base_delay_ms: u64,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let executor = RetryExecutor::new(RetryStrategy::Exponential {
        max_attempts,
        base_delay_ms,
        max_delay_ms: base_delay_ms * 16, // Cap at 16x base delay
    });

    executor.execute(operation).await
}

/// Recoverable error for an input that is absent or still being written
pub fn not_ready(path: &str, attempts: u32) -> JobError {
    JobError::InputNotReady {
        path: path.to_string(),
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_linear_retries_recoverable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_linear_backoff(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(not_ready("in.png", n))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            1,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_recoverable_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_linear_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Inference("model crashed".to_string()))
                }
            },
            5,
            1,
        )
        .await;

        assert!(matches!(result, Err(JobError::Inference(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let strategy = RetryStrategy::Exponential {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 400,
        };
        assert_eq!(strategy.delay_after(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_after(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_after(3), Duration::from_millis(400));
        assert_eq!(strategy.delay_after(9), Duration::from_millis(400));
    }
}
