// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Event Persister
//!
//! Reliable event ingestion and batched persistence over a publish/subscribe bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Bus Client                          │
//! │  • Idempotent topic/subscription provisioning               │
//! │  • Publisher (bounded, timed) and Puller (flow control)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (Puller, leases extended)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Persister                           │
//! │  • N workers sharing one rate limit (maxMPS)                │
//! │  • Per-partition batches, flushed by size or time           │
//! │  • Ack after a successful write, nack otherwise             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Sinks                             │
//! │  • In-memory, SQL (last-used upsert), Redis cache warmer    │
//! │  • Write-back cache for high-frequency last-write-wins keys │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once: a crash between a successful write and the ack
//! redelivers the batch, so every sink must be idempotent.
//!
//! ## Modules
//!
//! - [`bus`]: Bus client, providers (in-memory, Redis Streams), publisher, puller
//! - [`persister`]: Worker pool, rate limiter, sink contract
//! - [`batching`]: Hybrid size/time batcher
//! - [`write_back`]: Last-write-wins staging with periodic flush
//! - [`sinks`]: Concrete sinks
//! - [`resilience`]: Backoff and bounded retry
//! - [`health`]: Readiness aggregation

pub mod batching;
pub mod bus;
pub mod config;
pub mod health;
pub mod metrics;
pub mod persister;
pub mod resilience;
pub mod sinks;
pub mod write_back;

pub use bus::{
    BusClient, BusError, BusProvider, MemoryBus, Message, MessageSource, OutgoingMessage, Publisher, Puller,
    RedisStreamBus, Subscription,
};
pub use config::{BusConfig, MalformedPolicy, PersisterConfig, PublisherConfig, PullerConfig, WriteBackConfig};
pub use health::{HealthCheck, HealthChecker, HealthStatus};
pub use metrics::LatencyTimer;
pub use persister::{
    Decoder, FlushPolicy, HandledCode, JsonDecoder, Persister, PersisterError, PersisterState, RawDecoder, Sink,
    SinkError,
};
pub use resilience::{Backoff, ConstantBackoff, ExponentialBackoff, Retry, RetryConfig};
pub use sinks::{LastUsedSqlSink, MemorySink, RedisCacheSink};
pub use write_back::{FlushReport, KeyedSink, WriteBackCache};
