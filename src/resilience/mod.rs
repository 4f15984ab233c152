//! Resilience primitives shared by every service.
//!
//! | Primitive | Purpose |
//! |-----------|---------|
//! | [`Retry`] | Exponential backoff with jitter for transient provider errors |
//! | [`CircuitBreaker`] | Fail fast while a dependency keeps failing |
//! | [`ScopedCleanup`] | Remove temporary paths on every exit route |
//! | [`HealthChecker`] | Named boolean probes |

pub mod circuit_breaker;
pub mod cleanup;
pub mod health;
pub mod retry;

use std::future::Future;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use cleanup::ScopedCleanup;
pub use health::HealthChecker;
pub use retry::{Retry, RetryPolicy, RetryStats};

use crate::error::IndexResult;

/// Run `op` as `breaker(retry(op))`.
///
/// The whole retry sequence counts as one call against the breaker, so an
/// open circuit rejects before any attempt is made.
pub async fn guarded<T, F, Fut>(breaker: &CircuitBreaker, retry: &Retry, op: F) -> IndexResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IndexResult<T>>,
{
    breaker.call(|| retry.run(op)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::error::IndexError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_retry_loop() {
        let breaker = CircuitBreaker::new(
            "build",
            &CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_secs: 60,
                success_threshold: 1,
            },
        );
        let retry = Retry::new(RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            jitter: false,
            ..RetryPolicy::default()
        });
        let calls = AtomicU32::new(0);

        let first: IndexResult<()> = guarded(&breaker, &retry, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IndexError::provider("down", true))
        })
        .await;
        assert!(matches!(first, Err(IndexError::RetryExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);

        let second: IndexResult<()> = guarded(&breaker, &retry, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(matches!(second, Err(IndexError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
