// src/retry/strategy.rs

use crate::config::OutboundConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Attempt budget for one outbound dispatch. `max_attempts` counts the first
/// try, so zero configured retries means exactly one attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryPolicy {
    pub fn from_outbound(config: &OutboundConfig) -> Self {
        Self {
            max_attempts: config.retries.saturating_add(1),
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

impl RetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts.max(1)
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_with_decision(f, |_| RetryDecision::Retry).await
    }

    /// Execute with custom retry decision logic
    pub async fn execute_with_decision<F, Fut, T, E>(
        &self,
        mut f: F,
        should_retry: impl Fn(&E) -> RetryDecision,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if should_retry(&error) == RetryDecision::NoRetry {
                        debug!("Error is non-retryable: {}", error);
                        return Err(error);
                    }
                    if attempt >= self.max_attempts() {
                        if attempt > 1 {
                            warn!("Retry failed after {} attempts: {}", attempt, error);
                        }
                        return Err(error);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    debug!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, backoff
                    );

                    sleep(backoff).await;
                }
            }
        }
    }

    /// Calculate exponential backoff with jitter
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.backoff_base().as_millis() as u64;
        let max = self.policy.backoff_max().as_millis() as u64;

        // Exponential backoff: base * 2^(attempt - 1)
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt - 1));

        // Cap at maximum
        let capped = exponential.min(max);

        // Add jitter (0-25% of the calculated backoff)
        let jitter = (capped as f64 * rand::random::<f64>() * 0.25) as u64;

        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let strategy = RetryStrategy::new(policy(3));
        let counter = AtomicU32::new(0);

        let result = strategy
            .execute(|| async {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("Temporary failure")
                } else {
                    Ok("Success")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "Success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let strategy = RetryStrategy::new(RetryPolicy::from_outbound(&OutboundConfig::default()));
        let counter = AtomicU32::new(0);

        let result: Result<(), &str> = strategy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("Always fails")
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_early() {
        let strategy = RetryStrategy::new(policy(5));
        let counter = AtomicU32::new(0);

        let result: Result<(), &str> = strategy
            .execute_with_decision(
                || async {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                },
                |_| RetryDecision::NoRetry,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let strategy = RetryStrategy::new(policy(10));
        for attempt in 1..10 {
            assert!(strategy.calculate_backoff(attempt) <= Duration::from_millis(125));
        }
    }
}
