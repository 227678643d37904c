// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The seam between the bus client and a concrete pub/sub backend.
//!
//! Implementations report "already exists" from the create calls as
//! [`BusError::AlreadyExists`]; the client turns that into success. Everything
//! else about idempotency and retry lives in the client, not here.

use async_trait::async_trait;
use std::time::Duration;

use super::error::BusError;
use super::message::{Message, OutgoingMessage};

#[async_trait]
pub trait BusProvider: Send + Sync + 'static {
    /// Short name for logs and metrics ("memory", "redis", ...).
    fn name(&self) -> &'static str;

    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError>;

    /// Returns [`BusError::AlreadyExists`] if another creator got there first.
    async fn create_topic(&self, topic: &str) -> Result<(), BusError>;

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BusError>;

    /// Create `subscription` bound to `topic`.
    ///
    /// Returns [`BusError::AlreadyExists`] if another creator got there first,
    /// and [`BusError::InvalidTopic`] if the topic is missing.
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> Result<(), BusError>;

    /// Publish one message; returns the provider-assigned message id.
    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, BusError>;

    /// Pull up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// Returned messages are detached; an empty vec means nothing arrived in time.
    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, BusError>;

    async fn ack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError>;

    /// Make the messages eligible for redelivery.
    async fn nack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError>;

    /// Push the processing deadline of in-flight messages out by `deadline` from now.
    async fn extend_deadline(
        &self,
        topic: &str,
        subscription: &str,
        ids: &[String],
        deadline: Duration,
    ) -> Result<(), BusError>;
}
