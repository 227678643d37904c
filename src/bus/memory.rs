//! In-process bus used by tests, the demo, and local development in place of
//! an emulator.
//!
//! Semantics follow a pull-based pub/sub service closely enough to exercise
//! the pipeline: publishes fan out to every subscription of a topic, pulled
//! messages stay in flight until acked, nacked messages and messages whose
//! deadline lapsed are redelivered with a higher `delivery_attempt`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::error::BusError;
use super::message::{Message, OutgoingMessage};
use super::provider::BusProvider;

/// Provider calls that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    TopicExists,
    CreateTopic,
    SubscriptionExists,
    CreateSubscription,
    Publish,
    Receive,
}

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    payload: Vec<u8>,
    attributes: HashMap<String, String>,
    publish_time: SystemTime,
    delivery_attempt: u32,
}

impl Stored {
    fn to_message(&self) -> Message {
        let mut msg = Message::new(self.id.clone(), self.payload.clone())
            .with_publish_time(self.publish_time)
            .with_delivery_attempt(self.delivery_attempt);
        msg.attributes = self.attributes.clone();
        msg
    }
}

#[derive(Debug)]
struct SubscriptionState {
    ack_deadline: Duration,
    queue: VecDeque<Stored>,
    in_flight: HashMap<String, (Stored, Instant)>,
    acks: HashMap<String, u32>,
    nacks: u64,
}

impl SubscriptionState {
    fn new(ack_deadline: Duration) -> Self {
        Self {
            ack_deadline,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            acks: HashMap::new(),
            nacks: 0,
        }
    }

    fn requeue(&mut self, mut stored: Stored) {
        stored.delivery_attempt += 1;
        self.queue.push_back(stored);
    }

    /// Move lapsed in-flight messages back to the queue.
    fn expire(&mut self, now: Instant) {
        let lapsed: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in lapsed {
            if let Some((stored, _)) = self.in_flight.remove(&id) {
                self.requeue(stored);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
}

/// Counters for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionStats {
    pub pending: usize,
    pub in_flight: usize,
    pub acked: usize,
    pub nacked: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
    faults: Mutex<HashMap<FaultOp, u32>>,
    create_subscription_calls: AtomicU64,
    notify: Notify,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with a provider error.
    pub fn fail_next(&self, op: FaultOp, times: u32) {
        *self.faults.lock().entry(op).or_insert(0) += times;
    }

    fn check_fault(&self, op: FaultOp) -> Result<(), BusError> {
        let mut faults = self.faults.lock();
        match faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BusError::Provider(format!("injected fault on {op:?}")))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    #[must_use]
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.subscriptions.len())
    }

    /// Number of create-subscription calls that reached the provider, including conflicts.
    #[must_use]
    pub fn create_subscription_calls(&self) -> u64 {
        self.create_subscription_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self, topic: &str, subscription: &str) -> Option<SubscriptionStats> {
        let topics = self.topics.lock();
        let sub = topics.get(topic)?.subscriptions.get(subscription)?;
        Some(SubscriptionStats {
            pending: sub.queue.len(),
            in_flight: sub.in_flight.len(),
            acked: sub.acks.values().map(|n| *n as usize).sum(),
            nacked: sub.nacks,
        })
    }

    /// How many times message `id` was acked on `subscription` (1 is the only healthy answer).
    #[must_use]
    pub fn ack_count(&self, topic: &str, subscription: &str, id: &str) -> u32 {
        self.topics
            .lock()
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .and_then(|s| s.acks.get(id).copied())
            .unwrap_or(0)
    }

    fn take_ready(&self, topic: &str, subscription: &str, max: usize) -> Result<Vec<Message>, BusError> {
        let mut topics = self.topics.lock();
        let sub = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| BusError::SubscriptionNotFound(subscription.to_string()))?;

        let now = Instant::now();
        sub.expire(now);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(stored) = sub.queue.pop_front() else { break };
            out.push(stored.to_message());
            let deadline = now + sub.ack_deadline;
            sub.in_flight.insert(stored.id.clone(), (stored, deadline));
        }
        Ok(out)
    }
}

#[async_trait]
impl BusProvider for MemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        self.check_fault(FaultOp::TopicExists)?;
        Ok(self.topics.lock().contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        self.check_fault(FaultOp::CreateTopic)?;
        let mut topics = self.topics.lock();
        if topics.contains_key(topic) {
            return Err(BusError::AlreadyExists(topic.to_string()));
        }
        topics.insert(topic.to_string(), TopicState::default());
        Ok(())
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BusError> {
        self.check_fault(FaultOp::SubscriptionExists)?;
        Ok(self
            .topics
            .lock()
            .get(topic)
            .is_some_and(|t| t.subscriptions.contains_key(subscription)))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> Result<(), BusError> {
        self.create_subscription_calls.fetch_add(1, Ordering::Relaxed);
        self.check_fault(FaultOp::CreateSubscription)?;
        let mut topics = self.topics.lock();
        if topics.values().any(|t| t.subscriptions.contains_key(subscription)) {
            return Err(BusError::AlreadyExists(subscription.to_string()));
        }
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::InvalidTopic(topic.to_string()))?;
        state
            .subscriptions
            .insert(subscription.to_string(), SubscriptionState::new(ack_deadline));
        Ok(())
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, BusError> {
        self.check_fault(FaultOp::Publish)?;
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut topics = self.topics.lock();
            let state = topics
                .get_mut(topic)
                .ok_or_else(|| BusError::InvalidTopic(topic.to_string()))?;
            let stored = Stored {
                id: id.clone(),
                payload: message.payload,
                attributes: message.attributes,
                publish_time: SystemTime::now(),
                delivery_attempt: 1,
            };
            for sub in state.subscriptions.values_mut() {
                sub.queue.push_back(stored.clone());
            }
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, BusError> {
        self.check_fault(FaultOp::Receive)?;
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(topic, subscription, max_messages.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError> {
        let mut topics = self.topics.lock();
        let Some(sub) = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
        else {
            return Err(BusError::SubscriptionNotFound(subscription.to_string()));
        };
        for id in ids {
            // Acks for messages no longer in flight (lapsed and redelivered) are ignored
            if sub.in_flight.remove(id).is_some() {
                *sub.acks.entry(id.clone()).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    async fn nack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError> {
        {
            let mut topics = self.topics.lock();
            let Some(sub) = topics
                .get_mut(topic)
                .and_then(|t| t.subscriptions.get_mut(subscription))
            else {
                return Err(BusError::SubscriptionNotFound(subscription.to_string()));
            };
            for id in ids {
                if let Some((stored, _)) = sub.in_flight.remove(id) {
                    sub.nacks += 1;
                    sub.requeue(stored);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_deadline(
        &self,
        topic: &str,
        subscription: &str,
        ids: &[String],
        deadline: Duration,
    ) -> Result<(), BusError> {
        let mut topics = self.topics.lock();
        let Some(sub) = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
        else {
            return Err(BusError::SubscriptionNotFound(subscription.to_string()));
        };
        let new_deadline = Instant::now() + deadline;
        for id in ids {
            if let Some((_, d)) = sub.in_flight.get_mut(id) {
                *d = new_deadline;
            }
        }
        Ok(())
    }
}
