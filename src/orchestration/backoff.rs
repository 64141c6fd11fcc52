//! Bounded exponential backoff for summary persistence.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::store::PersistenceError;

/// Attempt budget, per-attempt timeout and delay curve
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the given failed attempt: `base * multiplier^(attempt-1)`, capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let delay_ms = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms.round().max(0.0) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

/// Outcome of a retried operation with the number of attempts spent
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, PersistenceError>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails permanently or the budget is spent
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(Ok(value)) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Ok(Err(error)) => error,
            Err(_) => PersistenceError::Timeout {
                timeout_ms: u64::try_from(policy.attempt_timeout.as_millis()).unwrap_or(u64::MAX),
            },
        };

        if !error.is_retryable() || attempt >= policy.max_attempts {
            warn!(
                operation = operation_name,
                attempt = attempt,
                error = %error,
                "Giving up on persistence operation"
            );
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            operation = operation_name,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying persistence operation"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            attempt_timeout: Duration::from_millis(50),
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_curve_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..policy(5)
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = retry_with_backoff(&policy(5), "upsert", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PersistenceError::Transient("503".into()))
                } else {
                    Ok("stored")
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), "stored");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let outcome: RetryOutcome<()> = retry_with_backoff(&policy(5), "upsert", || async {
            Err(PersistenceError::Permanent("400".into()))
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(PersistenceError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_budget_is_bounded_and_timeouts_count() {
        let outcome: RetryOutcome<()> = retry_with_backoff(&policy(3), "upsert", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(PersistenceError::Timeout { .. })));
    }
}
