//! Readiness aggregation across persisters and other long-running components.
//!
//! Each component exposes a cheap, synchronous [`HealthCheck`]. A
//! [`HealthChecker`] polls them on an interval and caches the result so a
//! probe endpoint never blocks on the components themselves.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics;

pub trait HealthCheck: Send + Sync {
    /// Name used in status reports and metrics.
    fn component(&self) -> &str;

    /// `Err` carries a human-readable reason.
    fn check(&self) -> Result<(), String>;
}

/// One unhealthy component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub component: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// No check has run yet
    Unknown,
    Healthy,
    Unhealthy(Vec<Failure>),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

pub struct HealthChecker {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    interval: Duration,
    status: watch::Sender<HealthStatus>,
}

impl HealthChecker {
    /// `interval` is raised to 1ms if zero.
    pub fn new(interval: Duration) -> Self {
        let (status, _) = watch::channel(HealthStatus::Unknown);
        Self {
            checks: RwLock::new(Vec::new()),
            interval: interval.max(Duration::from_millis(1)),
            status,
        }
    }

    pub fn add(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().push(check);
    }

    /// Run every check now. Healthy only if all components are.
    pub fn check_all(&self) -> HealthStatus {
        let checks = self.checks.read().clone();
        let mut failures = Vec::new();
        for check in &checks {
            let result = check.check();
            metrics::set_component_healthy(check.component(), result.is_ok());
            if let Err(reason) = result {
                failures.push(Failure {
                    component: check.component().to_string(),
                    reason,
                });
            }
        }

        if failures.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy(failures)
        }
    }

    /// Last cached status.
    pub fn status(&self) -> HealthStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    /// Re-check every interval until cancelled. Logs transitions only.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let next = self.check_all();
            let changed = *self.status.borrow() != next;
            if changed {
                match &next {
                    HealthStatus::Unhealthy(failures) => {
                        for f in failures {
                            warn!(component = %f.component, reason = %f.reason, "Component unhealthy");
                        }
                    }
                    HealthStatus::Healthy => info!("All components healthy"),
                    HealthStatus::Unknown => {}
                }
                self.status.send_replace(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle {
        name: &'static str,
        ok: AtomicBool,
    }

    impl HealthCheck for Toggle {
        fn component(&self) -> &str {
            self.name
        }

        fn check(&self) -> Result<(), String> {
            if self.ok.load(Ordering::Relaxed) {
                Ok(())
            } else {
                Err("down".into())
            }
        }
    }

    #[test]
    fn test_check_all_requires_every_component() {
        let checker = HealthChecker::new(Duration::from_secs(1));
        assert_eq!(checker.check_all(), HealthStatus::Healthy);

        let a = Arc::new(Toggle { name: "a", ok: AtomicBool::new(true) });
        let b = Arc::new(Toggle { name: "b", ok: AtomicBool::new(false) });
        checker.add(a.clone());
        checker.add(b.clone());

        match checker.check_all() {
            HealthStatus::Unhealthy(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].component, "b");
            }
            other => panic!("expected unhealthy, got {other:?}"),
        }

        b.ok.store(true, Ordering::Relaxed);
        assert!(checker.check_all().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_caches_status() {
        let checker = Arc::new(HealthChecker::new(Duration::from_secs(5)));
        let a = Arc::new(Toggle { name: "a", ok: AtomicBool::new(false) });
        checker.add(a.clone());
        assert_eq!(checker.status(), HealthStatus::Unknown);

        let cancel = CancellationToken::new();
        let task = {
            let checker = checker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { checker.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!checker.status().is_healthy());

        a.ok.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(checker.status().is_healthy());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_runs() {
        let checker = Arc::new(HealthChecker::new(Duration::ZERO));
        checker.add(Arc::new(Toggle { name: "a", ok: AtomicBool::new(true) }));

        let cancel = CancellationToken::new();
        let task = {
            let checker = checker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { checker.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(checker.status().is_healthy());

        cancel.cancel();
        task.await.unwrap();
    }
}
