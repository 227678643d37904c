// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One worker: rate-limit, pull, decode, batch, flush, settle.
//!
//! ```text
//! Idle ──token──► Pulling ──msg──► Accumulating ──size/time──► Flushing ──ok──► ack all ──► Idle
//!                                                                 │
//!                                                    retryable + local budget: backoff, write again
//!                                                                 │
//!                                                            otherwise: nack all ──► Idle
//! ```
//!
//! Each worker owns its batches outright; nothing on this path takes a lock
//! shared with other workers except the rate limiter.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::codes::HandledCode;
use super::sink::{FlushPolicy, SinkError};
use super::Inner;
use crate::batching::{BatchConfig, BatchableItem, FlushBatch, FlushReason, HybridBatcher};
use crate::bus::Message;
use crate::config::MalformedPolicy;
use crate::metrics;

/// A pulled message and its decoded value, settled together.
pub(crate) struct Pending<T> {
    message: Message,
    item: T,
}

impl<T> BatchableItem for Pending<T> {
    fn batch_key(&self) -> &str {
        self.message.dedupe_key()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => pending().await,
    }
}

pub(crate) async fn run<T: Send + Sync + 'static>(inner: Arc<Inner<T>>, worker_id: usize) {
    let name = inner.name.as_str();
    let cancel = inner.cancel.clone();
    let batch_config = BatchConfig::from(&inner.config);
    let mut batches: HashMap<String, HybridBatcher<Pending<T>>> = HashMap::new();

    debug!(persister = name, worker_id, "Worker started");

    // Held across iterations so a flush that preempts the pull keeps the token
    let mut token: Option<Instant> = None;

    loop {
        let deadline = batches.values().filter_map(HybridBatcher::deadline).min();
        let ready_at = *token.get_or_insert_with(|| reserve_token(&inner));

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until_opt(deadline) => {
                flush_due(&inner, &mut batches).await;
                continue;
            }
            next = pull(&inner, ready_at) => next,
        };
        token = None;

        let Some(message) = next else {
            // Source closed and drained
            break;
        };
        handle_message(&inner, &batch_config, &mut batches, message).await;
    }

    // Pulled messages are never dropped on shutdown: flush what is held
    for batcher in batches.values_mut() {
        if let Some(batch) = batcher.force_flush_with_reason(FlushReason::Shutdown) {
            flush(&inner, batch).await;
        }
    }
    debug!(persister = name, worker_id, "Worker stopped");
}

fn reserve_token<T: Send + Sync + 'static>(inner: &Inner<T>) -> Instant {
    let wait = inner.limiter.reserve();
    if !inner.limiter.is_unlimited() {
        metrics::record_rate_limit_wait(&inner.name, wait);
    }
    Instant::now() + wait
}

/// Wait until the reserved token is usable, then for the next message.
async fn pull<T: Send + Sync + 'static>(inner: &Inner<T>, ready_at: Instant) -> Option<Message> {
    sleep_until(ready_at).await;
    inner.source.next().await
}

async fn handle_message<T: Send + Sync + 'static>(
    inner: &Inner<T>,
    batch_config: &BatchConfig,
    batches: &mut HashMap<String, HybridBatcher<Pending<T>>>,
    message: Message,
) {
    let name = inner.name.as_str();

    let item = match inner.decoder.decode(&message) {
        Ok(item) => item,
        Err(e) => {
            warn!(
                persister = name,
                message_id = %message.id,
                delivery_attempt = message.delivery_attempt,
                error = %e,
                "Malformed message"
            );
            metrics::record_handled(name, HandledCode::BadMessage.as_str());
            match inner.config.malformed_policy {
                MalformedPolicy::Nack => message.nack(),
                MalformedPolicy::Ack => message.ack(),
            }
            return;
        }
    };

    if inner.config.require_id_attribute && message.entity_id().is_none() {
        warn!(persister = name, message_id = %message.id, "Message has no id attribute, skipping");
        metrics::record_handled(name, HandledCode::MissingId.as_str());
        message.ack();
        return;
    }

    let partition = inner.sink.partition(&item).unwrap_or_default();
    let batcher = batches
        .entry(partition)
        .or_insert_with(|| HybridBatcher::new(batch_config.clone()));

    if batcher.push(Pending { message, item }).is_some() {
        if let Some(batch) = batcher.take_if_ready() {
            flush(inner, batch).await;
        }
    }
}

async fn flush_due<T: Send + Sync + 'static>(
    inner: &Inner<T>,
    batches: &mut HashMap<String, HybridBatcher<Pending<T>>>,
) {
    for batcher in batches.values_mut() {
        if let Some(batch) = batcher.take_if_ready() {
            flush(inner, batch).await;
        }
    }
    batches.retain(|_, b| !b.is_empty());
}

/// Write a batch and settle every message in it exactly once.
async fn flush<T: Send + Sync + 'static>(inner: &Inner<T>, batch: FlushBatch<Pending<T>>) {
    let name = inner.name.as_str();
    let reason = batch.reason;
    let count = batch.items.len();
    let superseded = batch.superseded.len();

    let (messages, items): (Vec<Message>, Vec<T>) =
        batch.items.into_iter().map(|p| (p.message, p.item)).unzip();
    let replaced: Vec<Message> = batch.superseded.into_iter().map(|p| p.message).collect();

    metrics::record_batch_size(name, count);
    let started = StdInstant::now();
    let result = write(inner, &items).await;
    metrics::record_flush_duration(name, started.elapsed());

    match result {
        Ok(()) => {
            metrics::record_flush(name, "success");
            inner.health.record_flush_success();
            for msg in messages {
                metrics::record_handled(name, HandledCode::Ok.as_str());
                msg.ack();
            }
            for msg in replaced {
                metrics::record_handled(name, HandledCode::DuplicateId.as_str());
                msg.ack();
            }
            info!(persister = name, count, superseded, reason = reason.as_str(), "Batch flushed");
        }
        Err(e) => {
            metrics::record_flush(name, e.kind());
            let failures = inner.health.record_flush_failure();
            let code = if e.is_retryable() {
                HandledCode::RepeatableError
            } else {
                HandledCode::NonRepeatableError
            };
            if e.is_retryable() {
                warn!(persister = name, count, failures, error = %e, "Flush failed, nacking batch for redelivery");
            } else {
                error!(persister = name, count, failures, error = %e, "Sink rejected batch, nacking");
            }
            for msg in messages.into_iter().chain(replaced) {
                metrics::record_handled(name, code.as_str());
                msg.nack();
            }
        }
    }
}

/// One write under the flush timeout, plus local retries if the sink asks for them.
///
/// Retries stop once shutdown starts; the attempt already running is allowed to finish.
async fn write<T: Send + Sync + 'static>(inner: &Inner<T>, items: &[T]) -> Result<(), SinkError> {
    let name = inner.name.as_str();
    let timeout = inner.config.flush_timeout();
    let mut retry = match inner.sink.flush_policy() {
        FlushPolicy::NackOnly => None,
        FlushPolicy::RetryLocally(config) => Some(config.into_retry(inner.cancel.clone())),
    };

    loop {
        let attempt = tokio::time::timeout(timeout, inner.sink.write(items))
            .await
            .unwrap_or(Err(SinkError::Timeout(timeout)));

        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                let Some(retry) = retry.as_mut() else {
                    return Err(e);
                };
                warn!(persister = name, attempt = retry.calls() + 1, error = %e, "Sink write failed, retrying locally");
                if !retry.wait_next().await {
                    return Err(e);
                }
                metrics::record_flush_retry(name);
            }
            Err(e) => return Err(e),
        }
    }
}
