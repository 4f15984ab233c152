//! Named health probes.
//!
//! A probe is a zero-argument async check returning `true` when healthy.
//! Probes that exceed the checker's timeout count as unhealthy.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type Probe = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

pub struct HealthChecker {
    probes: BTreeMap<String, Probe>,
    timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: BTreeMap::new(),
            timeout,
        }
    }

    /// Register an async probe. Re-registering a name replaces the old one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let probe: Probe = Arc::new(move || Box::pin(probe()));
        self.probes.insert(name.into(), probe);
    }

    pub fn register_sync<F>(&mut self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let probe = Arc::new(probe);
        self.register(name, move || {
            let probe = probe.clone();
            async move { probe() }
        });
    }

    pub fn names(&self) -> Vec<String> {
        self.probes.keys().cloned().collect()
    }

    pub async fn run(&self, name: &str) -> Option<bool> {
        let probe = self.probes.get(name)?;
        Some(self.run_probe(name, probe).await)
    }

    async fn run_probe(&self, name: &str, probe: &Probe) -> bool {
        match tokio::time::timeout(self.timeout, probe()).await {
            Ok(ok) => {
                if !ok {
                    tracing::warn!(probe = name, "health probe failed");
                }
                ok
            }
            Err(_) => {
                tracing::warn!(probe = name, timeout = ?self.timeout, "health probe timed out");
                false
            }
        }
    }

    pub async fn run_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for (name, probe) in &self.probes {
            let ok = self.run_probe(name, probe).await;
            results.insert(name.clone(), ok);
        }
        results
    }

    /// Logical AND of every probe. An empty registry is healthy.
    pub async fn is_healthy(&self) -> bool {
        self.run_all().await.values().all(|ok| *ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overall_health_is_and_of_probes() {
        let mut checker = HealthChecker::default();
        checker.register_sync("storage", || true);
        checker.register("metadata", || async { true });
        assert!(checker.is_healthy().await);

        checker.register_sync("headroom", || false);
        let results = checker.run_all().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.get("headroom"), Some(&false));
        assert!(!checker.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out_as_unhealthy() {
        let mut checker = HealthChecker::new(Duration::from_millis(100));
        checker.register("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            true
        });
        assert_eq!(checker.run("slow").await, Some(false));
        assert_eq!(checker.run("missing").await, None);
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        assert!(HealthChecker::default().is_healthy().await);
    }
}
