// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pub/sub bus client.
//!
//! ```text
//! provider.rs  - BusProvider trait (the backend seam)
//! memory.rs    - in-process provider (tests, demo, emulator stand-in)
//! redis.rs     - Redis Streams provider
//! client.rs    - BusClient: idempotent topic/subscription provisioning
//! publisher.rs - Publisher: bounded, timed publishes
//! puller.rs    - Puller: flow-controlled streaming pull, ack loop, lease extension
//! message.rs   - Message (owns its ack decision), OutgoingMessage
//! ```

pub mod client;
pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod publisher;
pub mod puller;
pub mod redis;

pub use client::{BusClient, Subscription};
pub use error::BusError;
pub use memory::{FaultOp, MemoryBus, SubscriptionStats};
pub use message::{Message, OutgoingMessage, ID_ATTRIBUTE};
pub use provider::BusProvider;
pub use publisher::Publisher;
pub use puller::{MessageSource, Puller};
pub use self::redis::RedisStreamBus;
