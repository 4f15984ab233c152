//! Circuit breaker guarding one class of unreliable operation.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(recovery_timeout elapsed, next call)-----> HalfOpen
//! HalfOpen --(success_threshold successes)-----------> Closed
//! HalfOpen --(any failure)---------------------------> Open
//! ```
//!
//! All transitions happen under one mutex per breaker. The mutex is never
//! held while the guarded future runs.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{IndexError, IndexResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    trips: u64,
    rejected: u64,
    calls: u64,
}

/// Point-in-time view of a breaker for stats output.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Seconds since the last recorded failure.
    pub last_failure_secs_ago: Option<f64>,
    pub trips: u64,
    pub rejected: u64,
    pub calls: u64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                trips: 0,
                rejected: 0,
                calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic inside a transition leaves plain counters behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_secs_ago: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
            trips: inner.trips,
            rejected: inner.rejected,
            calls: inner.calls,
        }
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen once the
    /// recovery timeout has passed.
    fn admit(&self) -> IndexResult<()> {
        let mut inner = self.lock();
        inner.calls += 1;

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(self.recovery_timeout);
            if elapsed >= self.recovery_timeout {
                tracing::info!(breaker = %self.name, "circuit half-open, probing");
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            } else {
                inner.rejected += 1;
                return Err(IndexError::CircuitOpen {
                    name: self.name.clone(),
                    remaining: self.recovery_timeout - elapsed,
                });
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    tracing::info!(breaker = %self.name, "circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.trips += 1;
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.trips += 1;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Fails fast with [`IndexError::CircuitOpen`] without polling `op`
    /// while the circuit is open. Only errors for which
    /// [`IndexError::trips_breaker`] holds count as failures; anything else
    /// (cancellation, corruption of one document's files) passes through
    /// and leaves the state alone.
    pub async fn call<T, F, Fut>(&self, op: F) -> IndexResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IndexResult<T>>,
    {
        self.admit()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) if err.trips_breaker() => {
                self.on_failure();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                failure_threshold: failures,
                recovery_timeout_secs: timeout_secs,
                success_threshold: successes,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> IndexResult<()> {
        b.call(|| async { Err::<(), _>(IndexError::provider("boom", true)) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> IndexResult<u32> {
        b.call(|| async { Ok(1) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let b = breaker(3, 2, 30);
        for _ in 0..3 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(IndexError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closed_after_successes() {
        let b = breaker(2, 2, 10);
        fail(&b).await.ok();
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens() {
        let b = breaker(1, 3, 5);
        fail(&b).await.ok();
        tokio::time::advance(Duration::from_secs(6)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().trips, 2);
        assert!(matches!(
            succeed(&b).await,
            Err(IndexError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let b = breaker(3, 1, 60);
        fail(&b).await.ok();
        fail(&b).await.ok();
        succeed(&b).await.unwrap();
        fail(&b).await.ok();
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_counted() {
        let b = breaker(1, 1, 60);
        let result: IndexResult<()> = b.call(|| async { Err(IndexError::Cancelled) }).await;
        assert!(matches!(result, Err(IndexError::Cancelled)));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_document_level_errors_do_not_open_the_circuit() {
        let b = breaker(2, 1, 60);
        for _ in 0..5 {
            let result: IndexResult<()> = b
                .call(|| async { Err(IndexError::corruption("/idx/doc_1_aa", "bad primary")) })
                .await;
            assert!(matches!(result, Err(IndexError::Corruption { .. })));
        }
        let result: IndexResult<()> = b
            .call(|| async { Err(IndexError::storage("no such directory")) })
            .await;
        assert!(result.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
        assert_eq!(succeed(&b).await.unwrap(), 1);

        let exhausted = IndexError::RetryExhausted {
            attempts: 3,
            last: Box::new(IndexError::provider("timeout", true)),
        };
        let result: IndexResult<()> = b.call(|| async { Err(exhausted) }).await;
        assert!(result.is_err());
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
