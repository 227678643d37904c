// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Size- or time-bounded batching.
//!
//! The [`HybridBatcher`] collects items and hands them out when the batch
//! reaches `flush_size` items or its first item is `flush_interval` old,
//! whichever comes first. Items carry a key; pushing a key already in the
//! batch replaces the earlier item in place, so `len() <= flush_size` always
//! holds. Replaced items are kept aside in [`FlushBatch::superseded`] so the
//! caller can settle them together with the batch that absorbed them.
//!
//! # Example
//!
//! ```
//! use event_persister::batching::{BatchConfig, BatchableItem, FlushReason, HybridBatcher};
//! use std::time::Duration;
//!
//! struct Usage { key: String, at: i64 }
//! impl BatchableItem for Usage {
//!     fn batch_key(&self) -> &str { &self.key }
//! }
//!
//! let mut batcher = HybridBatcher::new(BatchConfig {
//!     flush_size: 2,
//!     flush_interval: Duration::from_secs(10),
//! });
//!
//! assert!(batcher.push(Usage { key: "k1".into(), at: 1 }).is_none());
//! // Same key: replaces, does not grow
//! assert!(batcher.push(Usage { key: "k1".into(), at: 2 }).is_none());
//! assert_eq!(batcher.len(), 1);
//!
//! assert_eq!(batcher.push(Usage { key: "k2".into(), at: 3 }), Some(FlushReason::Count));
//! let batch = batcher.force_flush_with_reason(FlushReason::Count).unwrap();
//! assert_eq!(batch.items.len(), 2);
//! assert_eq!(batch.superseded.len(), 1);
//! ```

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PersisterConfig;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// First item reached `flush_interval` of age
    Time,
    /// Item count reached `flush_size`
    Count,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Configuration for hybrid batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush after this many distinct items
    pub flush_size: usize,
    /// Flush once the first item has waited this long
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_size: 100,
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl From<&PersisterConfig> for BatchConfig {
    fn from(config: &PersisterConfig) -> Self {
        Self {
            flush_size: config.flush_size.max(1),
            flush_interval: config.flush_interval(),
        }
    }
}

/// Items that can be collapsed by key within one batch.
pub trait BatchableItem {
    fn batch_key(&self) -> &str;
}

/// A batch of items ready for flush
#[derive(Debug)]
pub struct FlushBatch<T> {
    /// Distinct items in arrival order
    pub items: Vec<T>,
    /// Earlier items replaced by a later one with the same key
    pub superseded: Vec<T>,
    pub reason: FlushReason,
    /// Time since the first item arrived
    pub age: Duration,
}

impl<T> FlushBatch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A batch of items pending flush
#[derive(Debug)]
struct Batch<T> {
    items: Vec<T>,
    index: HashMap<String, usize>,
    superseded: Vec<T>,
    started_at: Option<Instant>,
}

impl<T: BatchableItem> Batch<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            superseded: Vec::new(),
            started_at: None,
        }
    }

    fn push(&mut self, item: T) {
        self.started_at.get_or_insert_with(Instant::now);
        match self.index.get(item.batch_key()) {
            Some(&slot) => {
                let old = std::mem::replace(&mut self.items[slot], item);
                self.superseded.push(old);
            }
            None => {
                self.index.insert(item.batch_key().to_string(), self.items.len());
                self.items.push(item);
            }
        }
    }

    fn age(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn take(&mut self, reason: FlushReason) -> FlushBatch<T> {
        let age = self.age();
        self.index.clear();
        self.started_at = None;
        FlushBatch {
            items: std::mem::take(&mut self.items),
            superseded: std::mem::take(&mut self.superseded),
            reason,
            age,
        }
    }
}

/// Batcher that flushes on count or time, whichever threshold is hit first.
pub struct HybridBatcher<T> {
    config: BatchConfig,
    batch: Batch<T>,
}

impl<T: BatchableItem> HybridBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            batch: Batch::new(),
        }
    }

    /// Add an item to the batch, returns flush reason if the count threshold is hit
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        self.batch.push(item);
        (self.batch.items.len() >= self.config.flush_size).then_some(FlushReason::Count)
    }

    /// When the time threshold fires, if the batch has anything in it.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.batch.started_at.map(|t| t + self.config.flush_interval)
    }

    /// Check if time threshold exceeded
    #[must_use]
    pub fn should_flush_time(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Take the batch if any threshold is ready
    pub fn take_if_ready(&mut self) -> Option<FlushBatch<T>> {
        let reason = if self.batch.items.len() >= self.config.flush_size {
            FlushReason::Count
        } else if self.should_flush_time() {
            FlushReason::Time
        } else {
            return None;
        };
        Some(self.take(reason))
    }

    /// Force flush with a specific reason, regardless of thresholds
    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        if self.batch.items.is_empty() {
            return None;
        }
        Some(self.take(reason))
    }

    fn take(&mut self, reason: FlushReason) -> FlushBatch<T> {
        let batch = self.batch.take(reason);
        debug!(
            count = batch.items.len(),
            superseded = batch.superseded.len(),
            reason = reason.as_str(),
            "Batch taken for flush"
        );
        batch
    }

    /// Check if an item with the given key is in the pending batch.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.batch.index.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.items.is_empty()
    }

    /// Get current batch stats: (distinct items, superseded items, age)
    #[must_use]
    pub fn stats(&self) -> (usize, usize, Duration) {
        (self.batch.items.len(), self.batch.superseded.len(), self.batch.age())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestItem {
        key: String,
        value: u32,
    }

    impl BatchableItem for TestItem {
        fn batch_key(&self) -> &str {
            &self.key
        }
    }

    fn item(key: &str, value: u32) -> TestItem {
        TestItem {
            key: key.to_string(),
            value,
        }
    }

    fn config(flush_size: usize, secs: u64) -> BatchConfig {
        BatchConfig {
            flush_size,
            flush_interval: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_batch_empty_initially() {
        let batcher: HybridBatcher<TestItem> = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.is_empty());
        assert!(batcher.deadline().is_none());
        let (count, superseded, age) = batcher.stats();
        assert_eq!((count, superseded, age), (0, 0, Duration::ZERO));
    }

    #[test]
    fn test_flush_on_count_threshold() {
        let mut batcher = HybridBatcher::new(config(3, 10));

        assert!(batcher.push(item("a", 1)).is_none());
        assert!(batcher.push(item("b", 1)).is_none());
        assert_eq!(batcher.push(item("c", 1)), Some(FlushReason::Count));

        let batch = batcher.take_if_ready().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.reason, FlushReason::Count);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_duplicate_key_replaces_in_place() {
        let mut batcher = HybridBatcher::new(config(10, 10));
        batcher.push(item("a", 1));
        batcher.push(item("b", 1));
        batcher.push(item("a", 2));

        assert_eq!(batcher.len(), 2);
        assert!(batcher.contains("a"));

        let batch = batcher.force_flush_with_reason(FlushReason::Shutdown).unwrap();
        assert_eq!(batch.items, vec![item("a", 2), item("b", 1)]);
        assert_eq!(batch.superseded, vec![item("a", 1)]);
    }

    #[test]
    fn test_duplicates_do_not_count_toward_size() {
        let mut batcher = HybridBatcher::new(config(2, 10));
        assert!(batcher.push(item("a", 1)).is_none());
        assert!(batcher.push(item("a", 2)).is_none());
        assert!(batcher.push(item("a", 3)).is_none());
        assert_eq!(batcher.push(item("b", 1)), Some(FlushReason::Count));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_starts_at_first_item() {
        let mut batcher = HybridBatcher::new(config(100, 10));

        // An idle batcher never becomes due
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(batcher.take_if_ready().is_none());

        batcher.push(item("a", 1));
        let deadline = batcher.deadline().unwrap();
        assert_eq!(deadline, Instant::now() + Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(batcher.take_if_ready().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = batcher.take_if_ready().unwrap();
        assert_eq!(batch.reason, FlushReason::Time);
        assert_eq!(batch.age, Duration::from_secs(10));
        assert!(batcher.deadline().is_none());
    }

    #[test]
    fn test_force_flush_empty_is_none() {
        let mut batcher: HybridBatcher<TestItem> = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.force_flush_with_reason(FlushReason::Shutdown).is_none());
    }

    #[test]
    fn test_config_from_persister_config() {
        let persister = PersisterConfig {
            flush_size: 0,
            flush_interval_ms: 2_500,
            ..Default::default()
        };
        let config = BatchConfig::from(&persister);
        assert_eq!(config.flush_size, 1);
        assert_eq!(config.flush_interval, Duration::from_millis(2_500));
    }
}
