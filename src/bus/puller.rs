// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming pull with flow control.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────┐   Message (+ack handle, permits)
//! provider ──► │ receive loop │ ──────────────┐
//!   (xN)       └──────────────┘               ▼
//!                    ▲               bounded channel ──► next() ──► workers
//!   permits: max_outstanding_messages         │
//!            max_outstanding_bytes            │ ack()/nack()/drop
//!                                             ▼
//!              ┌──────────────┐        ┌──────────┐
//!              │  lease loop  │        │ ack loop │ ──► provider.ack / nack
//!              └──────────────┘        └──────────┘
//!   extends deadlines of unsettled messages up to max_extension
//! ```
//!
//! Backpressure lives in the permits: a receive loop cannot pull another
//! message until an earlier one is settled.
//!
//! Shutdown: receive loops stop on cancel, messages still sitting in the
//! channel are nacked, then `run` waits (bounded) for every handed-out message
//! to be settled by its owner so in-flight batches can still ack.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::Subscription;
use super::error::BusError;
use super::message::{AckHandle, AckReply, Message};
use super::provider::BusProvider;
use crate::config::PullerConfig;
use crate::metrics;
use crate::resilience::{Backoff, ExponentialBackoff};

/// Longest single long-poll against the provider.
const RECEIVE_WAIT: Duration = Duration::from_millis(500);
/// Settlements forwarded to the provider per call.
const ACK_BATCH: usize = 100;
/// How long `run` waits on shutdown for handed-out messages to be settled.
const SETTLE_GRACE: Duration = Duration::from_secs(60);

/// Anything the persister can drain messages from.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Name for logs and metrics.
    fn name(&self) -> &str;

    /// Pull until `cancel` fires, then drain. Call once.
    async fn run(&self, cancel: CancellationToken) -> Result<(), BusError>;

    /// Next message, or `None` once the source is closed and drained.
    async fn next(&self) -> Option<Message>;
}

struct Shared {
    provider: Arc<dyn BusProvider>,
    subscription: Subscription,
    message_permits: Arc<Semaphore>,
    byte_permits: Arc<Semaphore>,
    /// A single message never takes more than the whole byte budget
    max_message_bytes: u32,
    /// Unsettled message id -> time it was pulled
    leases: DashMap<String, Instant>,
}

pub struct Puller {
    shared: Arc<Shared>,
    config: PullerConfig,
    ack_deadline: Duration,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl std::fmt::Debug for Puller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller")
            .field("config", &self.config)
            .field("ack_deadline", &self.ack_deadline)
            .finish_non_exhaustive()
    }
}

impl Puller {
    pub(crate) fn new(
        provider: Arc<dyn BusProvider>,
        subscription: Subscription,
        config: PullerConfig,
        ack_deadline: Duration,
    ) -> Self {
        let max_messages = config.max_outstanding_messages.max(1);
        let max_bytes = config.max_outstanding_bytes.max(1);
        let (sender, receiver) = mpsc::channel(max_messages.min(10_000));

        Self {
            shared: Arc::new(Shared {
                provider,
                subscription,
                message_permits: Arc::new(Semaphore::new(max_messages)),
                byte_permits: Arc::new(Semaphore::new(max_bytes)),
                max_message_bytes: u32::try_from(max_bytes).unwrap_or(u32::MAX),
                leases: DashMap::new(),
            }),
            config,
            ack_deadline,
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.shared.subscription
    }

    /// Messages pulled and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.shared.leases.len()
    }
}

#[async_trait]
impl MessageSource for Puller {
    fn name(&self) -> &str {
        &self.shared.subscription.name
    }

    #[tracing::instrument(skip(self, cancel), fields(subscription = %self.shared.subscription.name))]
    async fn run(&self, cancel: CancellationToken) -> Result<(), BusError> {
        let Some(sender) = self.sender.lock().take() else {
            return Err(BusError::Closed);
        };
        let receivers = self.config.num_goroutines.max(1);
        info!(
            topic = %self.shared.subscription.topic,
            receivers,
            max_outstanding_messages = self.config.max_outstanding_messages,
            "Puller started"
        );

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let ack_task = tokio::spawn(ack_loop(Arc::clone(&self.shared), ack_rx));

        let lease_cancel = CancellationToken::new();
        let lease_task = tokio::spawn(lease_loop(
            Arc::clone(&self.shared),
            self.ack_deadline,
            self.config.max_extension(),
            lease_cancel.clone(),
        ));

        let mut loops = JoinSet::new();
        for _ in 0..receivers {
            loops.spawn(receive_loop(
                Arc::clone(&self.shared),
                sender.clone(),
                ack_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(sender);
        drop(ack_tx);

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Receive loop panicked");
                }
            }
        }

        // Never-delivered messages go straight back to the bus
        let drained = {
            let mut rx = self.receiver.lock().await;
            rx.close();
            let mut drained = 0usize;
            while let Ok(msg) = rx.try_recv() {
                msg.nack();
                drained += 1;
            }
            drained
        };
        if drained > 0 {
            debug!(drained, "Nacked buffered messages on shutdown");
        }

        // The ack loop ends once every handed-out message has been settled
        if tokio::time::timeout(SETTLE_GRACE, ack_task).await.is_err() {
            warn!(
                outstanding = self.shared.leases.len(),
                "Messages still unsettled after shutdown grace, bus will redeliver"
            );
        }
        lease_cancel.cancel();
        let _ = lease_task.await;

        info!("Puller stopped");
        Ok(())
    }

    async fn next(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    sender: mpsc::Sender<Message>,
    replies: mpsc::UnboundedSender<AckReply>,
    cancel: CancellationToken,
) {
    let sub = &shared.subscription;
    let template = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let mut backoff = template.fresh();

    'pull: loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&shared.message_permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = shared.provider.receive(&sub.topic, &sub.name, 1, RECEIVE_WAIT) => r,
        };

        let messages = match received {
            Ok(messages) => {
                backoff = template.fresh();
                messages
            }
            Err(e) => {
                drop(permit);
                let delay = backoff.next_delay();
                warn!(subscription = %sub.name, error = %e, ?delay, "Receive failed, backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let mut permit = Some(permit);
        for msg in messages {
            let message_permit = match permit.take() {
                Some(p) => p,
                None => match Arc::clone(&shared.message_permits).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break 'pull,
                },
            };
            shared.leases.insert(msg.id.clone(), Instant::now());
            let mut msg = msg.attach(AckHandle::new(replies.clone(), message_permit));

            let bytes = u32::try_from(msg.size_bytes())
                .unwrap_or(u32::MAX)
                .min(shared.max_message_bytes);
            if bytes > 0 {
                tokio::select! {
                    biased;
                    // Dropping the message nacks it
                    _ = cancel.cancelled() => break 'pull,
                    byte_permit = Arc::clone(&shared.byte_permits).acquire_many_owned(bytes) => {
                        if let Ok(p) = byte_permit {
                            msg.attach_byte_permit(p);
                        }
                    }
                }
            }

            metrics::record_received(&sub.name);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'pull,
                sent = sender.send(msg) => if sent.is_err() { break 'pull },
            }
        }
    }
    debug!(subscription = %sub.name, "Receive loop exited");
}

async fn ack_loop(shared: Arc<Shared>, mut replies: mpsc::UnboundedReceiver<AckReply>) {
    let sub = &shared.subscription;
    let mut acks = Vec::new();
    let mut nacks = Vec::new();

    while let Some(first) = replies.recv().await {
        let mut next = Some(first);
        while let Some(reply) = next.take() {
            match reply {
                AckReply::Ack(id) => acks.push(id),
                AckReply::Nack(id) => nacks.push(id),
            }
            if acks.len() + nacks.len() >= ACK_BATCH {
                break;
            }
            next = replies.try_recv().ok();
        }

        for id in acks.iter().chain(nacks.iter()) {
            shared.leases.remove(id);
        }
        if !acks.is_empty() {
            if let Err(e) = shared.provider.ack(&sub.topic, &sub.name, &acks).await {
                warn!(subscription = %sub.name, count = acks.len(), error = %e, "Ack failed, bus will redeliver");
            }
            metrics::record_settled(&sub.name, "ack", acks.len());
            acks.clear();
        }
        if !nacks.is_empty() {
            if let Err(e) = shared.provider.nack(&sub.topic, &sub.name, &nacks).await {
                warn!(subscription = %sub.name, count = nacks.len(), error = %e, "Nack failed");
            }
            metrics::record_settled(&sub.name, "nack", nacks.len());
            nacks.clear();
        }
        metrics::set_outstanding_messages(&sub.name, shared.leases.len());
    }
}

async fn lease_loop(
    shared: Arc<Shared>,
    ack_deadline: Duration,
    max_extension: Duration,
    cancel: CancellationToken,
) {
    let sub = &shared.subscription;
    let period = (ack_deadline / 2).max(Duration::from_millis(100));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let mut extend = Vec::new();
        let mut expired = Vec::new();
        for lease in shared.leases.iter() {
            if now.duration_since(*lease.value()) < max_extension {
                extend.push(lease.key().clone());
            } else {
                expired.push(lease.key().clone());
            }
        }

        if !expired.is_empty() {
            for id in &expired {
                shared.leases.remove(id);
            }
            warn!(subscription = %sub.name, count = expired.len(), "Stopped extending leases past max extension");
            metrics::record_lease_expired(&sub.name, expired.len());
        }
        if !extend.is_empty() {
            if let Err(e) = shared
                .provider
                .extend_deadline(&sub.topic, &sub.name, &extend, ack_deadline)
                .await
            {
                warn!(subscription = %sub.name, error = %e, "Deadline extension failed");
            }
        }
    }
}
