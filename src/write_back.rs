// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-back coalescing for very frequent, low-stakes updates.
//!
//! Producers call [`WriteBackCache::stage`] as often as they like; only the
//! value with the greatest caller-supplied `observed_at` per key is kept. A
//! ticker calls [`WriteBackCache::flush_all`], which writes every staged entry
//! and removes only those that were written and not superseded meanwhile.
//!
//! The ticker exits on cancellation without a final flush. Call `flush_all`
//! yourself before cancelling if the staged data must not be lost.
//!
//! # Example
//!
//! ```
//! use event_persister::WriteBackCache;
//!
//! let cache: WriteBackCache<u64> = WriteBackCache::new("last-used");
//! assert!(cache.stage("k1", 100, 1));
//! assert!(!cache.stage("k1", 50, 0)); // older observation, dropped
//! assert_eq!(cache.get("k1"), Some((100, 1)));
//! assert!(cache.stage("k1", 200, 2));
//! assert_eq!(cache.get("k1"), Some((200, 2)));
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WriteBackConfig;
use crate::metrics;
use crate::persister::SinkError;

/// Sink for write-back entries, one key at a time.
#[async_trait]
pub trait KeyedSink<V>: Send + Sync + 'static {
    /// Must be idempotent and must not regress a newer stored value.
    async fn write_entry(&self, key: &str, value: &V, observed_at: i64) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
struct StagedEntry<V> {
    value: V,
    observed_at: i64,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    /// Written, but a newer value arrived during the write and stays staged
    pub superseded: usize,
}

pub struct WriteBackCache<V> {
    name: String,
    staged: DashMap<String, StagedEntry<V>>,
}

impl<V: Clone + Send + Sync + 'static> WriteBackCache<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            staged: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage `value` for `key` if it is newer than what is staged.
    ///
    /// Returns `false` when the call was a no-op because an entry with an
    /// equal or greater `observed_at` is already staged.
    pub fn stage(&self, key: impl Into<String>, value: V, observed_at: i64) -> bool {
        match self.staged.entry(key.into()) {
            Entry::Occupied(mut existing) => {
                if existing.get().observed_at < observed_at {
                    existing.insert(StagedEntry { value, observed_at });
                    true
                } else {
                    metrics::record_write_back_stale(&self.name);
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(StagedEntry { value, observed_at });
                true
            }
        }
    }

    /// Staged value and its observation time.
    pub fn get(&self, key: &str) -> Option<(V, i64)> {
        self.staged
            .get(key)
            .map(|e| (e.value.clone(), e.observed_at))
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Write every staged entry; drop from staging only what was written.
    pub async fn flush_all(&self, sink: &dyn KeyedSink<V>) -> FlushReport {
        // Snapshot first so no shard lock is held across an await
        let snapshot: Vec<(String, StagedEntry<V>)> = self
            .staged
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut report = FlushReport::default();
        for (key, entry) in snapshot {
            match sink.write_entry(&key, &entry.value, entry.observed_at).await {
                Ok(()) => {
                    report.written += 1;
                    let removed = self
                        .staged
                        .remove_if(&key, |_, current| current.observed_at == entry.observed_at);
                    if removed.is_none() {
                        report.superseded += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(cache = %self.name, key = %key, error = %e, "Write-back entry failed, kept for next flush");
                }
            }
        }

        metrics::record_write_back_flush(&self.name, report.written, report.failed);
        metrics::set_write_back_staged(&self.name, self.staged.len());
        if report.written > 0 || report.failed > 0 {
            debug!(
                cache = %self.name,
                written = report.written,
                failed = report.failed,
                superseded = report.superseded,
                "Write-back flush"
            );
        }
        report
    }

    /// Flush every `flush_interval` until `cancel` fires. No final flush.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn KeyedSink<V>>, config: WriteBackConfig, cancel: CancellationToken) {
        let period = config.flush_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(cache = %self.name, ?period, "Write-back flusher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_all(sink.as_ref()).await;
                }
            }
        }
        info!(cache = %self.name, staged = self.staged.len(), "Write-back flusher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<HashMap<String, (u64, i64)>>,
        fail_keys: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl KeyedSink<u64> for RecordingSink {
        async fn write_entry(&self, key: &str, value: &u64, observed_at: i64) -> Result<(), SinkError> {
            if self.fail_keys.lock().contains(key) {
                return Err(SinkError::Retryable(format!("{key} unavailable")));
            }
            self.written.lock().insert(key.to_string(), (*value, observed_at));
            Ok(())
        }
    }

    #[test]
    fn test_last_write_wins_by_observed_at() {
        let cache = WriteBackCache::new("t");
        assert!(cache.stage("k1", 100u64, 1));
        assert!(!cache.stage("k1", 50, 0));
        assert_eq!(cache.get("k1"), Some((100, 1)));

        // Equal timestamps do not replace
        assert!(!cache.stage("k1", 75, 1));
        assert_eq!(cache.get("k1"), Some((100, 1)));

        assert!(cache.stage("k1", 200, 2));
        assert_eq!(cache.get("k1"), Some((200, 2)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_flush_retains_failures() {
        let cache = WriteBackCache::new("t");
        cache.stage("k1", 1u64, 10);
        cache.stage("k2", 2u64, 10);

        let sink = RecordingSink::default();
        sink.fail_keys.lock().insert("k2".into());

        let report = cache.flush_all(&sink).await;
        assert_eq!(report.written, 1);
        assert_eq!(report.failed, 1);
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.get("k2"), Some((2, 10)));

        // Next cycle succeeds
        sink.fail_keys.lock().clear();
        let report = cache.flush_all(&sink).await;
        assert_eq!(report.written, 1);
        assert!(cache.is_empty());
        assert_eq!(sink.written.lock().get("k2"), Some(&(2, 10)));
    }

    #[tokio::test]
    async fn test_concurrent_stagers_keep_max() {
        let cache = Arc::new(WriteBackCache::new("t"));
        let mut handles = Vec::new();
        for task in 0..8i64 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100i64 {
                    let at = i * 8 + task;
                    c.stage(format!("k{}", i % 4), at as u64, at);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(cache.len(), 4);
        for k in 0..4i64 {
            let (_, at) = cache.get(&format!("k{k}")).unwrap();
            // Largest i with i % 4 == k is 96 + k, written by task 7
            assert_eq!(at, (96 + k) * 8 + 7);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_flushes_and_exits_without_final_flush() {
        let cache = Arc::new(WriteBackCache::new("t"));
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let config = WriteBackConfig { flush_interval_ms: 60_000 };

        let task = tokio::spawn(cache.clone().run(sink.clone(), config, cancel.clone()));

        cache.stage("k1", 1u64, 1);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty());
        assert_eq!(sink.written.lock().len(), 1);

        cache.stage("k2", 2u64, 1);
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(!sink.written.lock().contains_key("k2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_ticker_still_flushes() {
        let cache = Arc::new(WriteBackCache::new("t"));
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let config = WriteBackConfig { flush_interval_ms: 0 };

        let task = tokio::spawn(cache.clone().run(sink.clone(), config, cancel.clone()));

        cache.stage("k1", 1u64, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.is_empty());
        assert_eq!(sink.written.lock().get("k1"), Some(&(1, 1)));

        cancel.cancel();
        task.await.unwrap();
    }
}
