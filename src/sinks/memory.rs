//! In-memory sink with failure injection.
//!
//! Every successful write is recorded as one batch, so tests can assert both
//! on what was written and on how it was grouped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::persister::{FlushPolicy, Sink, SinkError};

type Partitioner<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

pub struct MemorySink<T> {
    name: String,
    batches: Mutex<Vec<Vec<T>>>,
    failures: Mutex<VecDeque<SinkError>>,
    panics: AtomicU32,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicU64,
    policy: FlushPolicy,
    partitioner: Option<Partitioner<T>>,
}

impl<T: Clone + Send + Sync + 'static> MemorySink<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            panics: AtomicU32::new(0),
            delay: Mutex::new(None),
            attempts: AtomicU64::new(0),
            policy: FlushPolicy::NackOnly,
            partitioner: None,
        }
    }

    #[must_use]
    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_partitioner(mut self, f: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.partitioner = Some(Box::new(f));
        self
    }

    /// Fail the next `times` writes with `error`.
    pub fn fail_next(&self, times: usize, error: SinkError) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Panic inside the next `times` writes.
    pub fn panic_next(&self, times: u32) {
        self.panics.fetch_add(times, Ordering::Relaxed);
    }

    /// Sleep this long inside every write.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches.lock().clone()
    }

    /// Every written item in write order, redeliveries included.
    pub fn items(&self) -> Vec<T> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Idempotent view: the last written item per key.
    pub fn keyed<K: Eq + Hash>(&self, key: impl Fn(&T) -> K) -> HashMap<K, T> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .map(|item| (key(item), item.clone()))
            .collect()
    }

    /// Write calls so far, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for MemorySink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, batch: &[T]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let panic_now = self
            .panics
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if panic_now {
            panic!("injected sink panic");
        }

        let failure = self.failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        self.batches.lock().push(batch.to_vec());
        Ok(())
    }

    fn flush_policy(&self) -> FlushPolicy {
        self.policy.clone()
    }

    fn partition(&self, item: &T) -> Option<String> {
        self.partitioner.as_ref().map(|f| f(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_batches() {
        let sink = MemorySink::new("m");
        sink.write(&[1, 2]).await.unwrap();
        sink.write(&[2, 3]).await.unwrap();

        assert_eq!(sink.batches(), vec![vec![1, 2], vec![2, 3]]);
        assert_eq!(sink.items(), vec![1, 2, 2, 3]);
        assert_eq!(sink.keyed(|i| *i).len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let sink = MemorySink::new("m");
        sink.fail_next(2, SinkError::Retryable("down".into()));

        assert!(sink.write(&[1]).await.is_err());
        assert!(sink.write(&[1]).await.is_err());
        assert!(sink.write(&[1]).await.is_ok());
        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.items(), vec![1]);
    }

    #[test]
    fn test_partitioner() {
        let sink = MemorySink::<(String, u32)>::new("m").with_partitioner(|(table, _)| table.clone());
        assert_eq!(sink.partition(&("users".into(), 1)), Some("users".into()));
        assert_eq!(MemorySink::<u32>::new("m").partition(&1), None);
    }
}
