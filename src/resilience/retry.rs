//! Retry with exponential backoff.
//!
//! The first retry waits `initial_delay`; each later wait is multiplied by
//! `exponential_base` and capped at `max_delay`. With jitter enabled each
//! wait is scaled by a random factor in `[0.5, 1.0]`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, IndexError, IndexResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Kinds that propagate immediately even if flagged retryable.
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            exponential_base: config.exponential_base,
            jitter: config.jitter,
            non_retryable: vec![
                ErrorKind::Cancelled,
                ErrorKind::Validation,
                ErrorKind::AlreadyExists,
                ErrorKind::CircuitOpen,
            ],
        }
    }

    pub fn should_retry(&self, err: &IndexError) -> bool {
        err.is_retryable() && !self.non_retryable.contains(&err.kind())
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.exponential_base.powi(retry as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Counters accumulated across every call made through one [`Retry`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub calls: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub exhausted: u64,
    pub error_kinds: BTreeMap<String, u64>,
}

pub struct Retry {
    policy: RetryPolicy,
    stats: Mutex<RetryStats>,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut RetryStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` tries have been made.
    ///
    /// Exhausting every attempt yields [`IndexError::RetryExhausted`]
    /// wrapping the last failure.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> IndexResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IndexResult<T>>,
    {
        self.record(|s| s.calls += 1);
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.record(|s| s.attempts += 1);

            match op().await {
                Ok(value) => {
                    self.record(|s| s.successes += 1);
                    return Ok(value);
                }
                Err(err) => {
                    self.record(|s| {
                        s.failures += 1;
                        *s.error_kinds
                            .entry(err.kind().as_str().to_string())
                            .or_insert(0) += 1;
                    });

                    if !self.policy.should_retry(&err) {
                        return Err(err);
                    }

                    if attempt >= max_attempts {
                        self.record(|s| s.exhausted += 1);
                        tracing::warn!(attempts = attempt, error = %err, "retry attempts exhausted");
                        return Err(IndexError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let wait = self.policy.delay_for(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retryable error, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, initial_ms: u64, base: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_secs(60),
            exponential_base: base,
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_op_runs_exactly_max_attempts() {
        let retry = Retry::new(policy(4, 10, 2.0));
        let calls = AtomicU32::new(0);

        let result: IndexResult<()> = retry
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IndexError::provider("503", true))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(IndexError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last.kind(), ErrorKind::Provider);
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
        let stats = retry.stats();
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.error_kinds.get("provider"), Some(&4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_one_and_two_second_waits() {
        let retry = Retry::new(policy(3, 1000, 2.0));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let value = retry
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(IndexError::provider("rate limited", true))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let retry = Retry::new(policy(5, 1, 2.0));
        let calls = AtomicU32::new(0);

        let result: IndexResult<()> = retry
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IndexError::Cancelled)
            })
            .await;

        assert!(matches!(result, Err(IndexError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut p = policy(10, 1000, 10.0);
        p.max_delay = Duration::from_secs(5);
        assert_eq!(p.base_delay(0), Duration::from_secs(1));
        assert_eq!(p.base_delay(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let mut p = policy(3, 1000, 2.0);
        p.jitter = true;
        for _ in 0..50 {
            let d = p.delay_for(1);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(2000));
        }
    }
}
