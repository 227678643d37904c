// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The downstream a persister flushes batches into.
//!
//! Sinks must be idempotent: a batch is acked only after `write` succeeds, so
//! a crash between the two redelivers a batch that was already written.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::RetryConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Worth trying again (connection drop, lock timeout, throttling)
    #[error("retryable sink error: {0}")]
    Retryable(String),
    /// Redelivery cannot fix it (schema violation, constraint failure)
    #[error("terminal sink error: {0}")]
    Terminal(String),
    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal(_))
    }

    /// Label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "retryable",
            Self::Terminal(_) => "terminal",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
                SinkError::Terminal(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::TypeNotFound { .. } => {
                SinkError::Terminal(err.to_string())
            }
            _ => SinkError::Retryable(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for SinkError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            SinkError::Retryable(err.to_string())
        } else {
            SinkError::Terminal(err.to_string())
        }
    }
}

/// What a failed retryable write does before the batch is nacked.
#[derive(Debug, Clone, Default)]
pub enum FlushPolicy {
    /// Nack at once and let the bus redeliver
    #[default]
    NackOnly,
    /// Retry the write in place within this budget, then nack
    RetryLocally(RetryConfig),
}

impl FlushPolicy {
    /// Local retry with `max_attempts` total writes and exponential backoff.
    #[must_use]
    pub fn retry_locally(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self::RetryLocally(RetryConfig {
            initial_delay,
            max_delay,
            factor: 2.0,
            max_retries: Some(max_attempts.max(1)),
        })
    }
}

#[async_trait]
pub trait Sink<T>: Send + Sync + 'static {
    /// Name for logs and metrics.
    fn name(&self) -> &str;

    /// Durably write the batch, in order. Must tolerate redelivered items.
    async fn write(&self, batch: &[T]) -> Result<(), SinkError>;

    fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::NackOnly
    }

    /// Batches are kept per partition; `None` puts everything in one batch.
    fn partition(&self, _item: &T) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SinkError::Retryable("conn reset".into()).is_retryable());
        assert!(SinkError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!SinkError::Terminal("bad column".into()).is_retryable());
        assert_eq!(SinkError::Timeout(Duration::ZERO).kind(), "timeout");
    }

    #[test]
    fn test_sqlx_pool_errors_are_retryable() {
        assert!(SinkError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(SinkError::from(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn test_retry_locally_counts_total_attempts() {
        match FlushPolicy::retry_locally(0, Duration::from_millis(1), Duration::from_millis(2)) {
            FlushPolicy::RetryLocally(cfg) => assert_eq!(cfg.max_retries, Some(1)),
            FlushPolicy::NackOnly => panic!("expected local retry"),
        }
    }
}
