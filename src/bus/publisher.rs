use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use super::error::BusError;
use super::message::OutgoingMessage;
use super::provider::BusProvider;
use crate::config::PublisherConfig;
use crate::metrics::{self, LatencyTimer};

/// Publishes to one topic with bounded parallelism and a per-call timeout.
pub struct Publisher {
    provider: Arc<dyn BusProvider>,
    topic: String,
    config: PublisherConfig,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub(crate) fn new(provider: Arc<dyn BusProvider>, topic: &str, config: PublisherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.num_goroutines.max(1)));
        Self {
            provider,
            topic: topic.to_string(),
            config,
            permits,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one message, returning its bus id.
    ///
    /// Waiting for a free slot counts against the timeout.
    pub async fn publish(&self, message: OutgoingMessage) -> Result<String, BusError> {
        let timeout = self.config.timeout();
        let _timer = LatencyTimer::new(self.topic.clone(), "publish");

        let result = tokio::time::timeout(timeout, async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| BusError::Closed)?;
            self.provider.publish(&self.topic, message).await
        })
        .await
        .unwrap_or(Err(BusError::Timeout(timeout)));

        match &result {
            Ok(_) => metrics::record_published(&self.topic, "success"),
            Err(BusError::Timeout(_)) => metrics::record_published(&self.topic, "timeout"),
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Publish failed");
                metrics::record_published(&self.topic, "error");
            }
        }
        result
    }

    /// Publish all messages concurrently; returns the failures keyed by input index.
    pub async fn publish_multi(&self, messages: Vec<OutgoingMessage>) -> HashMap<usize, BusError> {
        let results = join_all(messages.into_iter().map(|m| self.publish(m))).await;
        results
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.err().map(|e| (i, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::{FaultOp, MemoryBus};
    use std::time::Duration;

    async fn publisher(bus: Arc<MemoryBus>) -> Publisher {
        bus.create_topic("events").await.unwrap();
        bus.create_subscription("events", "sub", Duration::from_secs(10))
            .await
            .unwrap();
        Publisher::new(bus, "events", PublisherConfig::default())
    }

    #[tokio::test]
    async fn test_publish_returns_id() {
        let bus = Arc::new(MemoryBus::new());
        let p = publisher(bus.clone()).await;
        let id = p.publish(OutgoingMessage::new(b"hello".to_vec())).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(bus.stats("events", "sub").unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_publish_multi_reports_failures_by_index() {
        let bus = Arc::new(MemoryBus::new());
        let p = publisher(bus.clone()).await;
        bus.fail_next(FaultOp::Publish, 1);

        let msgs = (0..4)
            .map(|i| OutgoingMessage::new(vec![i as u8]))
            .collect::<Vec<_>>();
        let errors = p.publish_multi(msgs).await;

        assert_eq!(errors.len(), 1);
        assert_eq!(bus.stats("events", "sub").unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_publish_to_missing_topic() {
        let bus = Arc::new(MemoryBus::new());
        let p = Publisher::new(bus, "ghost", PublisherConfig::default());
        let err = p.publish(OutgoingMessage::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic(_)));
    }
}
