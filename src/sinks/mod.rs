//! Concrete [`Sink`](crate::persister::Sink) implementations.
//!
//! - [`MemorySink`]: in-process, used by tests and the demo
//! - [`LastUsedSqlSink`]: API-key last-used timestamps in SQLite/MySQL
//! - [`RedisCacheSink`]: cache warmer writing one key per entity

pub mod memory;
pub mod redis;
pub mod sql;

pub use memory::MemorySink;
pub use self::redis::{CacheEntry, RedisCacheSink};
pub use sql::{LastUsed, LastUsedSqlSink};
