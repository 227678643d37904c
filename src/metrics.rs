// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for event-persister.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The owning process installs the recorder/exporter (Prometheus, OTEL, etc.)
//! once at wiring time; nothing in this crate registers globals.
//!
//! # Metric Naming Convention
//! - `event_persister_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `persister`: name of the persister / sink pipeline
//! - `subscription`, `topic`: bus resources
//! - `kind`: topic, subscription
//! - `code`: handled code (ok, bad_message, missing_id, ...)
//! - `outcome` / `status`: success, error, timeout, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one provisioning attempt (outcome: exists, created, conflict, error)
pub fn record_provision_attempt(kind: &str, outcome: &str) {
    counter!(
        "event_persister_provision_attempts_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a publish call
pub fn record_published(topic: &str, status: &str) {
    counter!(
        "event_persister_published_total",
        "topic" => topic.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "event_persister_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a message handed to consumers by a puller
pub fn record_received(subscription: &str) {
    counter!(
        "event_persister_messages_received_total",
        "subscription" => subscription.to_string()
    )
    .increment(1);
}

/// Record acks/nacks forwarded to the bus (outcome: ack, nack)
pub fn record_settled(subscription: &str, outcome: &str, count: usize) {
    counter!(
        "event_persister_messages_settled_total",
        "subscription" => subscription.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Messages pulled and not yet settled
pub fn set_outstanding_messages(subscription: &str, count: usize) {
    gauge!(
        "event_persister_outstanding_messages",
        "subscription" => subscription.to_string()
    )
    .set(count as f64);
}

/// Leases given up after max extension (bus will redeliver)
pub fn record_lease_expired(subscription: &str, count: usize) {
    counter!(
        "event_persister_lease_expired_total",
        "subscription" => subscription.to_string()
    )
    .increment(count as u64);
}

/// Record a message outcome by handled code
pub fn record_handled(persister: &str, code: &str) {
    counter!(
        "event_persister_handled_total",
        "persister" => persister.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record batch size at flush time
pub fn record_batch_size(persister: &str, count: usize) {
    histogram!(
        "event_persister_batch_size",
        "persister" => persister.to_string()
    )
    .record(count as f64);
}

/// Record flush duration (including local retries)
pub fn record_flush_duration(persister: &str, duration: Duration) {
    histogram!(
        "event_persister_flush_seconds",
        "persister" => persister.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record flush outcome (success, retryable, terminal, timeout)
pub fn record_flush(persister: &str, outcome: &str) {
    counter!(
        "event_persister_flushes_total",
        "persister" => persister.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a local sink retry
pub fn record_flush_retry(persister: &str) {
    counter!(
        "event_persister_flush_retries_total",
        "persister" => persister.to_string()
    )
    .increment(1);
}

/// Time spent waiting on the shared rate limiter
pub fn record_rate_limit_wait(persister: &str, duration: Duration) {
    histogram!(
        "event_persister_rate_limit_wait_seconds",
        "persister" => persister.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a worker restarted after a panic
pub fn record_worker_restart(persister: &str) {
    counter!(
        "event_persister_worker_restarts_total",
        "persister" => persister.to_string()
    )
    .increment(1);
}

/// Live workers in a pool
pub fn set_active_workers(persister: &str, count: usize) {
    gauge!(
        "event_persister_active_workers",
        "persister" => persister.to_string()
    )
    .set(count as f64);
}

/// Entries currently staged in a write-back cache
pub fn set_write_back_staged(cache: &str, count: usize) {
    gauge!(
        "event_persister_write_back_staged",
        "cache" => cache.to_string()
    )
    .set(count as f64);
}

/// Record a write-back flush pass
pub fn record_write_back_flush(cache: &str, written: usize, failed: usize) {
    counter!(
        "event_persister_write_back_written_total",
        "cache" => cache.to_string()
    )
    .increment(written as u64);
    counter!(
        "event_persister_write_back_failed_total",
        "cache" => cache.to_string()
    )
    .increment(failed as u64);
}

/// Record a stage call dropped because a newer value is already staged
pub fn record_write_back_stale(cache: &str) {
    counter!(
        "event_persister_write_back_stale_total",
        "cache" => cache.to_string()
    )
    .increment(1);
}

/// Set component health status (1 = healthy, 0 = unhealthy)
pub fn set_component_healthy(component: &str, healthy: bool) {
    gauge!(
        "event_persister_component_healthy",
        "component" => component.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: impl Into<String>, operation: &'static str) -> Self {
        Self {
            component: component.into(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.component, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests verify the API doesn't panic without a recorder installed.
    // The demo prints real values through metrics-util's DebuggingRecorder.

    #[test]
    fn test_bus_metrics() {
        record_provision_attempt("subscription", "created");
        record_provision_attempt("topic", "conflict");
        record_published("events", "success");
        record_received("events-sub");
        record_settled("events-sub", "ack", 5);
        set_outstanding_messages("events-sub", 12);
        record_lease_expired("events-sub", 1);
    }

    #[test]
    fn test_persister_metrics() {
        record_handled("api-keys", "ok");
        record_handled("api-keys", "bad_message");
        record_batch_size("api-keys", 100);
        record_flush_duration("api-keys", Duration::from_millis(12));
        record_flush("api-keys", "success");
        record_flush_retry("api-keys");
        record_rate_limit_wait("api-keys", Duration::from_micros(300));
        record_worker_restart("api-keys");
        set_active_workers("api-keys", 4);
    }

    #[test]
    fn test_write_back_and_health_metrics() {
        set_write_back_staged("last-used", 42);
        record_write_back_flush("last-used", 40, 2);
        record_write_back_stale("last-used");
        set_component_healthy("api-keys", true);
        set_component_healthy("api-keys", false);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("events", "publish");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
