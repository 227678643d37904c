// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent provisioning of topics and subscriptions.
//!
//! Replicated services race to create the same subscription at startup. Every
//! acquisition runs the same loop, bounded by a [`Retry`] and an overall
//! timeout:
//!
//! ```text
//! exists? ──yes──► done
//!    │no
//! create ──ok──► done
//!    │AlreadyExists ──► exists? ──yes──► done (someone else won)
//!    │                         └─no──► bound elsewhere, remember and retry
//!    │other error ──► remember, wait_next() ──► loop / give up with last error
//! ```

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::BusError;
use super::provider::BusProvider;
use super::publisher::Publisher;
use super::puller::Puller;
use crate::config::{BusConfig, PublisherConfig, PullerConfig};
use crate::metrics;
use crate::resilience::{ExponentialBackoff, Retry};

/// Handle to a provisioned subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    pub topic: String,
}

/// Owns the provider and hands out publishers and pullers.
pub struct BusClient {
    provider: Arc<dyn BusProvider>,
    config: BusConfig,
    cancel: CancellationToken,
}

impl BusClient {
    pub fn new(provider: Arc<dyn BusProvider>, config: BusConfig) -> Self {
        Self {
            provider,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<dyn BusProvider> {
        Arc::clone(&self.provider)
    }

    /// Abort any provisioning still waiting between attempts.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Ensure `id` exists as a topic.
    #[tracing::instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn topic(&self, id: &str) -> Result<(), BusError> {
        let provider = &self.provider;
        self.ensure(
            "topic",
            id,
            move || provider.topic_exists(id),
            move || provider.create_topic(id),
        )
        .await
    }

    /// Ensure subscription `id` exists on `topic`; returns a handle to it.
    #[tracing::instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn subscription(&self, id: &str, topic: &str) -> Result<Subscription, BusError> {
        let provider = &self.provider;
        let ack_deadline = self.config.ack_deadline();
        self.ensure(
            "subscription",
            id,
            move || provider.subscription_exists(topic, id),
            move || provider.create_subscription(topic, id, ack_deadline),
        )
        .await?;
        Ok(Subscription {
            name: id.to_string(),
            topic: topic.to_string(),
        })
    }

    /// Build a publisher for an existing topic.
    ///
    /// Against an emulator the topic is created instead, since nothing is pre-provisioned there.
    pub async fn create_publisher(&self, topic: &str, config: PublisherConfig) -> Result<Publisher, BusError> {
        self.require_topic(topic).await?;
        Ok(Publisher::new(Arc::clone(&self.provider), topic, config))
    }

    /// Provision `subscription` on an existing topic and build a puller for it.
    pub async fn create_puller(
        &self,
        subscription: &str,
        topic: &str,
        config: PullerConfig,
    ) -> Result<Arc<Puller>, BusError> {
        self.require_topic(topic).await?;
        let sub = self.subscription(subscription, topic).await?;
        Ok(Arc::new(Puller::new(
            Arc::clone(&self.provider),
            sub,
            config,
            self.config.ack_deadline(),
        )))
    }

    async fn require_topic(&self, topic: &str) -> Result<(), BusError> {
        if self.config.emulator {
            return self.topic(topic).await;
        }
        if self.provider.topic_exists(topic).await? {
            Ok(())
        } else {
            Err(BusError::InvalidTopic(topic.to_string()))
        }
    }

    fn provision_retry(&self) -> Retry {
        let backoff = ExponentialBackoff::new(
            std::time::Duration::from_millis(self.config.provision_initial_backoff_ms),
            std::time::Duration::from_millis(self.config.provision_max_backoff_ms),
        );
        // The first attempt does not wait, so the wait budget is attempts - 1
        Retry::new(
            self.cancel.child_token(),
            self.config.provision_max_attempts.saturating_sub(1),
            Box::new(backoff),
        )
    }

    async fn ensure<E, EFut, C, CFut>(
        &self,
        kind: &'static str,
        name: &str,
        mut exists: E,
        mut create: C,
    ) -> Result<(), BusError>
    where
        E: FnMut() -> EFut,
        EFut: Future<Output = Result<bool, BusError>>,
        C: FnMut() -> CFut,
        CFut: Future<Output = Result<(), BusError>>,
    {
        let mut retry = self.provision_retry();

        let attempts = async {
            loop {
                let last_err = match exists().await {
                    Ok(true) => {
                        metrics::record_provision_attempt(kind, "exists");
                        return Ok(());
                    }
                    Ok(false) => match create().await {
                        Ok(()) => {
                            metrics::record_provision_attempt(kind, "created");
                            info!(kind, name, "Created bus resource");
                            return Ok(());
                        }
                        // The name is taken; only a winner with the same binding counts as success.
                        Err(e) if e.is_already_exists() => match exists().await {
                            Ok(true) => {
                                metrics::record_provision_attempt(kind, "conflict");
                                debug!(kind, name, "Lost creation race, resource already exists");
                                return Ok(());
                            }
                            Ok(false) => {
                                metrics::record_provision_attempt(kind, "error");
                                warn!(
                                    kind,
                                    name,
                                    attempt = retry.calls() + 1,
                                    "Name taken by a resource with another binding"
                                );
                                BusError::Provider(format!("{kind} '{name}' already exists bound elsewhere"))
                            }
                            Err(e) => {
                                metrics::record_provision_attempt(kind, "error");
                                warn!(kind, name, attempt = retry.calls() + 1, error = %e, "Existence recheck failed");
                                e
                            }
                        },
                        Err(e) => {
                            metrics::record_provision_attempt(kind, "error");
                            warn!(kind, name, attempt = retry.calls() + 1, error = %e, "Create failed");
                            e
                        }
                    },
                    Err(e) => {
                        metrics::record_provision_attempt(kind, "error");
                        warn!(kind, name, attempt = retry.calls() + 1, error = %e, "Existence check failed");
                        e
                    }
                };
                if !retry.wait_next().await {
                    return Err(last_err);
                }
            }
        };

        let timeout = self.config.provision_timeout();
        match tokio::time::timeout(timeout, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(kind, name, ?timeout, "Provisioning timed out");
                Err(BusError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::{FaultOp, MemoryBus};
    use crate::bus::message::{Message, OutgoingMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// A competitor creates the subscription between our existence check and our create.
    struct RacingBus {
        inner: MemoryBus,
        exists_calls: AtomicU32,
    }

    #[async_trait]
    impl BusProvider for RacingBus {
        fn name(&self) -> &'static str {
            "racing"
        }

        async fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
            self.inner.topic_exists(topic).await
        }

        async fn create_topic(&self, topic: &str) -> Result<(), BusError> {
            self.inner.create_topic(topic).await
        }

        async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BusError> {
            // First look is stale
            if self.exists_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(false);
            }
            self.inner.subscription_exists(topic, subscription).await
        }

        async fn create_subscription(
            &self,
            topic: &str,
            subscription: &str,
            ack_deadline: Duration,
        ) -> Result<(), BusError> {
            self.inner.create_subscription(topic, subscription, ack_deadline).await?;
            Err(BusError::AlreadyExists(subscription.to_string()))
        }

        async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, BusError> {
            self.inner.publish(topic, message).await
        }

        async fn receive(
            &self,
            topic: &str,
            subscription: &str,
            max_messages: usize,
            wait: Duration,
        ) -> Result<Vec<Message>, BusError> {
            self.inner.receive(topic, subscription, max_messages, wait).await
        }

        async fn ack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError> {
            self.inner.ack(topic, subscription, ids).await
        }

        async fn nack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError> {
            self.inner.nack(topic, subscription, ids).await
        }

        async fn extend_deadline(
            &self,
            topic: &str,
            subscription: &str,
            ids: &[String],
            deadline: Duration,
        ) -> Result<(), BusError> {
            self.inner.extend_deadline(topic, subscription, ids, deadline).await
        }
    }

    fn fast_config() -> BusConfig {
        BusConfig {
            provision_max_attempts: 3,
            provision_initial_backoff_ms: 1,
            provision_max_backoff_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscription_created_once_then_found() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(bus.clone(), fast_config());

        client.topic("events").await.unwrap();
        let sub = client.subscription("events-sub", "events").await.unwrap();
        assert_eq!(sub.topic, "events");
        client.subscription("events-sub", "events").await.unwrap();

        assert_eq!(bus.subscription_count("events"), 1);
        assert_eq!(bus.create_subscription_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(bus.clone(), fast_config());
        bus.fail_next(FaultOp::TopicExists, 2);

        client.topic("events").await.unwrap();
        assert_eq!(bus.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_error() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(bus.clone(), fast_config());
        bus.fail_next(FaultOp::CreateTopic, 10);

        let err = client.topic("events").await.unwrap_err();
        assert!(matches!(err, BusError::Provider(ref m) if m.contains("CreateTopic")));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_on_missing_topic_fails() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(bus, fast_config());

        let err = client.subscription("sub", "nope").await.unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic(_)));
    }

    #[tokio::test]
    async fn test_publisher_requires_topic_unless_emulator() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(bus.clone(), fast_config());
        let err = client
            .create_publisher("events", PublisherConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic(_)));

        let emulated = BusClient::new(
            bus.clone(),
            BusConfig {
                emulator: true,
                ..fast_config()
            },
        );
        emulated
            .create_publisher("events", PublisherConfig::default())
            .await
            .unwrap();
        assert_eq!(bus.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_close_aborts_backoff() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(
            bus.clone(),
            BusConfig {
                provision_max_attempts: 10,
                provision_initial_backoff_ms: 60_000,
                provision_max_backoff_ms: 60_000,
                ..Default::default()
            },
        );
        bus.fail_next(FaultOp::TopicExists, 100);
        client.close();

        let start = std::time::Instant::now();
        assert!(client.topic("events").await.is_err());
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lost_creation_race_is_success() {
        let bus = Arc::new(RacingBus {
            inner: MemoryBus::new(),
            exists_calls: AtomicU32::new(0),
        });
        bus.inner.create_topic("events").await.unwrap();
        let client = BusClient::new(bus.clone(), fast_config());

        let sub = client.subscription("events-sub", "events").await.unwrap();
        assert_eq!(sub.topic, "events");
        assert_eq!(bus.inner.create_subscription_calls(), 1);
        assert_eq!(bus.inner.subscription_count("events"), 1);
        // Stale check, then the recheck after the conflict
        assert_eq!(bus.exists_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_name_bound_to_other_topic_is_an_error() {
        let bus = Arc::new(MemoryBus::new());
        let client = BusClient::new(bus.clone(), fast_config());
        client.topic("a").await.unwrap();
        client.topic("b").await.unwrap();
        client.subscription("sub", "a").await.unwrap();

        let err = client.subscription("sub", "b").await.unwrap_err();
        assert!(matches!(err, BusError::Provider(ref m) if m.contains("bound elsewhere")));
        assert!(!bus.subscription_exists("b", "sub").await.unwrap());
        assert!(bus.subscription_exists("a", "sub").await.unwrap());
    }
}
