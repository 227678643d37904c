//! Cache warmer: one Redis key per entity, overwritten on every write.
//!
//! `SET` is naturally idempotent, so redelivery only rewrites the same value.
//! A batch goes out as a single pipeline.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{pipe, Client};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::persister::{Sink, SinkError};
use crate::resilience::{retry, RetryConfig};

/// An entity to cache under `prefix + id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub value: serde_json::Value,
}

pub struct RedisCacheSink {
    connection: ConnectionManager,
    prefix: String,
    ttl_secs: Option<u64>,
}

impl RedisCacheSink {
    pub async fn connect(connection_string: &str, prefix: &str) -> Result<Self, SinkError> {
        let client = Client::open(connection_string)?;
        let connection = retry("redis_sink_connect", &RetryConfig::startup(), &CancellationToken::new(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        info!(prefix, "Connected Redis cache sink");
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            ttl_secs: None,
        })
    }

    /// Expire cached keys after `ttl_secs`.
    #[must_use]
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    #[inline]
    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl Sink<CacheEntry> for RedisCacheSink {
    fn name(&self) -> &str {
        "redis_cache"
    }

    async fn write(&self, batch: &[CacheEntry]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipeline = pipe();
        for entry in batch {
            let key = self.key(&entry.id);
            let body = serde_json::to_string(&entry.value).map_err(|e| SinkError::Terminal(e.to_string()))?;
            match self.ttl_secs {
                Some(ttl) => {
                    pipeline.set_ex(key, body, ttl).ignore();
                }
                None => {
                    pipeline.set(key, body).ignore();
                }
            }
        }

        let mut conn = self.connection.clone();
        pipeline.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
