// =============================================================================
// Retry Executor — classified retry with backoff + a failure-rate breaker
// =============================================================================
//
// Generalises the atomic-counter/threshold style of binance/rate_limit.rs
// from a request-weight tracker into a general-purpose failure-rate circuit
// breaker sitting in front of any exchange call.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Classify a raw error message as retryable or not. Mirrors the substring
/// matching a caller would do against an HTTP client's error text.
pub fn is_retryable_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    const PATTERNS: &[&str] = &[
        "timeout",
        "timed out",
        "econnreset",
        "econnrefused",
        "connection reset",
        "fetch failed",
        "429",
        "500",
        "502",
        "503",
        "504",
        "network",
    ];
    PATTERNS.iter().any(|p| lower.contains(p))
}

/// Trips after `3 * max_attempts` recent failures and stays open for a
/// cool-off period before allowing calls through again.
pub struct RetryExecutor {
    config: RetryConfig,
    recent_failures: AtomicU32,
    cooloff_until_epoch_ms: AtomicU64,
    cooloff: Duration,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            recent_failures: AtomicU32::new(0),
            cooloff_until_epoch_ms: AtomicU64::new(0),
            cooloff: Duration::from_secs(60),
        }
    }

    fn now_epoch_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn breaker_open(&self) -> bool {
        Self::now_epoch_ms() < self.cooloff_until_epoch_ms.load(Ordering::Relaxed)
    }

    fn trip_breaker(&self) {
        let until = Self::now_epoch_ms() + self.cooloff.as_millis() as u64;
        self.cooloff_until_epoch_ms.store(until, Ordering::Relaxed);
        warn!("retry executor circuit breaker tripped — cooling off");
    }

    /// Run `op`, retrying with exponential backoff + jitter on classified
    /// transient errors, up to `max_attempts`. Short-circuits with
    /// `CoreError::Degraded` if the circuit breaker is currently open.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        if self.breaker_open() {
            return Err(CoreError::degraded(
                "retry executor circuit breaker is open",
            ));
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    self.recent_failures.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_attempts {
                        let failures = self.recent_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        if failures >= self.config.max_attempts.saturating_mul(3) {
                            self.trip_breaker();
                        }
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying after transient error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// `base_delay * 2^(attempt-1)`, so the first retry (`attempt == 1`) uses
    /// the base delay unscaled and each subsequent attempt doubles it.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
        let jitter_pct = rand::thread_rng().gen_range(-20..=20);
        let jittered = (exp as i64 + (exp as i64 * jitter_pct) / 100).max(0) as u64;
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;

    #[test]
    fn classifies_known_transient_patterns() {
        assert!(is_retryable_message("request timed out"));
        assert!(is_retryable_message("HTTP 503 Service Unavailable"));
        assert!(is_retryable_message("ECONNRESET"));
        assert!(!is_retryable_message("invalid signature"));
        assert!(!is_retryable_message("insufficient balance"));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        });
        let calls = Arc::new(Counter::new(0));
        let c = calls.clone();
        let result = executor
            .run(|| {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(CoreError::transient("timeout"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_errors() {
        let executor = RetryExecutor::new(RetryConfig::default());
        let calls = Arc::new(Counter::new(0));
        let c = calls.clone();
        let result: Result<(), CoreError> = executor
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::fatal("bad api key"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_retry_uses_base_delay_unscaled() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        });
        let delay = executor.backoff_delay(1).as_millis();
        // base * 2^0 = base, +/- 20% jitter.
        assert!((800..=1200).contains(&delay), "delay was {delay}");
    }

    #[test]
    fn second_retry_doubles_the_base_delay() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        });
        let delay = executor.backoff_delay(2).as_millis();
        // base * 2^1 = 2 * base, +/- 20% jitter.
        assert!((1600..=2400).contains(&delay), "delay was {delay}");
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_repeated_failures() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        });
        for _ in 0..3 {
            let _: Result<(), CoreError> =
                executor.run(|| async { Err(CoreError::transient("timeout")) }).await;
        }
        let result: Result<(), CoreError> =
            executor.run(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CoreError::Degraded(_))));
    }
}
