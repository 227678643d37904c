// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff and cancellation.
//!
//! [`Retry`] is the primitive: an attempt counter that consults a [`Backoff`]
//! and a [`CancellationToken`] between attempts. [`retry()`] wraps it for the
//! common "run this future until it succeeds or the budget is gone" case, with
//! presets in [`RetryConfig`].
//!
//! # Example
//!
//! ```
//! use event_persister::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Daemon: never give up on reconnection
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None); // Infinite
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backoff::{Backoff, ExponentialBackoff};

/// Attempt budget between retries.
///
/// Every call to [`wait_next`](Self::wait_next) that is inside the budget
/// consumes exactly one attempt, including calls that return `false` because
/// the token was cancelled, so a caller cannot spin on a cancelled token.
#[derive(Debug)]
pub struct Retry {
    cancel: CancellationToken,
    max: usize,
    calls: usize,
    backoff: Box<dyn Backoff>,
}

impl Retry {
    pub fn new(cancel: CancellationToken, max: usize, backoff: Box<dyn Backoff>) -> Self {
        Self {
            cancel,
            max,
            calls: 0,
            backoff,
        }
    }

    /// Wait for the next attempt.
    ///
    /// Returns `false` when the budget is exhausted (give up and surface the
    /// last error) or when the token fires before the delay elapses.
    pub async fn wait_next(&mut self) -> bool {
        if self.calls >= self.max {
            return false;
        }
        self.calls += 1;

        if self.cancel.is_cancelled() {
            return false;
        }
        let delay = self.backoff.next_delay();
        if delay.is_zero() {
            return true;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Attempts consumed so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }
}

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections and provisioning
/// - [`RetryConfig::daemon()`] - Infinite retry for runtime reconnection
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry for long-running daemons.
    /// Retries forever with exponential backoff capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay).with_factor(self.factor)
    }

    /// Build a [`Retry`] allowing `max_retries` waits between attempts.
    #[must_use]
    pub fn into_retry(&self, cancel: CancellationToken) -> Retry {
        // The first attempt is free, so the wait budget is one less than the attempt budget.
        let max = self.max_retries.map_or(usize::MAX, |m| m.saturating_sub(1));
        Retry::new(cancel, max, Box::new(self.backoff()))
    }
}

/// Run `operation` until it succeeds, the budget is spent, or `cancel` fires.
///
/// `max_retries` counts total attempts. The last error is returned on give-up.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut budget = config.into_retry(cancel.clone());

    loop {
        match operation().await {
            Ok(val) => {
                if budget.calls() > 0 {
                    info!(operation = operation_name, retries = budget.calls(), "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                let attempt = budget.calls() + 1;
                match config.max_retries {
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt,
                        max,
                        error = %err,
                        "Operation failed"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Operation failed, will retry forever"
                    ),
                }
                if !budget.wait_next().await {
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::backoff::ConstantBackoff;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let mut r = Retry::new(
            CancellationToken::new(),
            3,
            Box::new(ConstantBackoff::new(Duration::from_millis(1))),
        );

        assert!(r.wait_next().await);
        assert!(r.wait_next().await);
        assert!(r.wait_next().await);
        assert!(!r.wait_next().await);
        assert_eq!(r.calls(), 3);

        // Stays exhausted
        assert!(!r.wait_next().await);
        assert_eq!(r.calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_delay_returns_immediately() {
        let mut r = Retry::new(CancellationToken::new(), 1, Box::new(ConstantBackoff::immediate()));
        let start = Instant::now();
        assert!(r.wait_next().await);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!r.wait_next().await);
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_pending_delay() {
        let cancel = CancellationToken::new();
        let mut r = Retry::new(
            cancel.clone(),
            5,
            Box::new(ConstantBackoff::new(Duration::from_secs(30))),
        );

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert!(!r.wait_next().await);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(r.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_still_consumes_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut r = Retry::new(cancel, 2, Box::new(ConstantBackoff::immediate()));

        assert!(!r.wait_next().await);
        assert!(!r.wait_next().await);
        assert!(!r.wait_next().await);
        assert_eq!(r.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            &CancellationToken::new(),
            || async { Ok(42) },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            &CancellationToken::new(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            &CancellationToken::new(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("always fail".to_string()))
                }
            },
        )
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), TestError> = retry("test_op", &RetryConfig::daemon(), &cancel, || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("down".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert!(RetryConfig::daemon().max_retries.is_none());
        assert_eq!(RetryConfig::query().max_retries, Some(3));
    }

    #[test]
    fn test_config_backoff_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_retries: Some(5),
        };

        let mut backoff = config.backoff();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
