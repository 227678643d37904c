//! Token bucket shared by every worker of one persister.
//!
//! Tokens refill continuously at `max_per_second` with a burst of the same
//! size. [`RateLimiter::acquire`] reserves a token up front and sleeps off any
//! deficit, so concurrent callers queue fairly without a wakeup storm.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// `None` means unlimited
    rate: Option<f64>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `max_per_second == 0` disables limiting.
    pub fn new(max_per_second: u32) -> Self {
        let rate = (max_per_second > 0).then_some(f64::from(max_per_second));
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate.unwrap_or(0.0),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate.is_none()
    }

    /// Take one token and return how long the caller must wait before using it.
    ///
    /// The token is spent even if the caller stops waiting, so a caller that
    /// can be preempted must hold on to the reservation.
    pub fn reserve(&self) -> Duration {
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * rate;
        bucket.tokens = (bucket.tokens + refill).min(rate);
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }

    /// Wait for a token. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let wait = self.reserve();
        if wait.is_zero() {
            return true;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Take a token only if one is available now.
    pub fn try_acquire(&self) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * rate;
        bucket.tokens = (bucket.tokens + refill).min(rate);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_paced() {
        let limiter = RateLimiter::new(10);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..10 {
            assert!(limiter.acquire(&cancel).await);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The next ten are paced at 100ms apiece
        for _ in 0..10 {
            assert!(limiter.acquire(&cancel).await);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(5));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = limiter.clone();
            let c = cancel.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    l.acquire(&c).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // 20 tokens at 5/s with a burst of 5 takes ~3s regardless of task count
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2900), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&cancel).await);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        assert!(!limiter.acquire(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_and_unlimited() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        let unlimited = RateLimiter::new(0);
        assert!(unlimited.is_unlimited());
        for _ in 0..1000 {
            assert!(unlimited.try_acquire());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_reports_deficit() {
        let limiter = RateLimiter::new(2);
        assert_eq!(limiter.reserve(), Duration::ZERO);
        assert_eq!(limiter.reserve(), Duration::ZERO);
        assert_eq!(limiter.reserve(), Duration::from_millis(500));
        assert_eq!(limiter.reserve(), Duration::from_secs(1));

        assert_eq!(RateLimiter::new(0).reserve(), Duration::ZERO);
    }
}
