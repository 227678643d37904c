// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff strategies producing successive retry delays.
//!
//! A [`Backoff`] is stateful: every call to [`Backoff::next_delay`] advances it.
//! Call sites that need their own schedule take a [`Backoff::fresh`] copy so no
//! two retry loops ever share mutable state.
//!
//! # Example
//!
//! ```
//! use event_persister::{Backoff, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(350)); // capped
//!
//! // A fresh copy starts over with the same parameters
//! let mut again = backoff.fresh();
//! assert_eq!(again.next_delay(), Duration::from_millis(100));
//! ```

use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

/// Produces the delay before each successive attempt.
pub trait Backoff: Send + Sync + Debug {
    /// Delay before the next attempt. Advances internal state.
    fn next_delay(&mut self) -> Duration;

    /// Independent copy with the same parameters and reset state.
    fn fresh(&self) -> Box<dyn Backoff>;
}

impl Backoff for Box<dyn Backoff> {
    fn next_delay(&mut self) -> Duration {
        (**self).next_delay()
    }

    fn fresh(&self) -> Box<dyn Backoff> {
        (**self).fresh()
    }
}

/// Exponential backoff: `initial`, `initial * factor`, ... capped at `max`.
///
/// Deterministic unless [`with_jitter`](Self::with_jitter) is set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    /// Fraction of the delay randomly added or removed (0.0 = none)
    jitter: f64,
    current: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2.0,
            jitter: 0.0,
            current: initial,
        }
    }

    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Spread delays by up to `ratio` of their value in either direction.
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread).min(self.max)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .map_or(self.max, |next| next.min(self.max));
        self.jittered(delay)
    }

    fn fresh(&self) -> Box<dyn Backoff> {
        Box::new(Self {
            current: self.initial,
            ..self.clone()
        })
    }
}

/// Same delay every time. `Duration::ZERO` means "retry immediately".
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    #[must_use]
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Backoff for ConstantBackoff {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn fresh(&self) -> Box<dyn Backoff> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_then_caps() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn test_custom_factor() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(10))
            .with_factor(3.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(30));
        assert_eq!(backoff.next_delay(), Duration::from_millis(90));
    }

    #[test]
    fn test_fresh_copy_is_independent() {
        let mut original = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(5));
        original.next_delay();
        original.next_delay();

        let mut copy = original.fresh();
        assert_eq!(copy.next_delay(), Duration::from_millis(50));
        // Advancing the copy leaves the original where it was
        copy.next_delay();
        assert_eq!(original.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.5);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(1));
        }
        let mut first = backoff.fresh();
        let d = first.next_delay();
        assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
    }

    #[test]
    fn test_constant_and_immediate() {
        let mut constant = ConstantBackoff::new(Duration::from_millis(7));
        assert_eq!(constant.next_delay(), Duration::from_millis(7));
        assert_eq!(constant.next_delay(), Duration::from_millis(7));

        let mut immediate = ConstantBackoff::immediate();
        assert!(immediate.next_delay().is_zero());
    }
}
