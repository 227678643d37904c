// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! API-key "last used" timestamps in SQLite or MySQL.
//!
//! ```sql
//! CREATE TABLE api_key_last_used (
//!   id VARCHAR(255) PRIMARY KEY,
//!   last_used_at BIGINT NOT NULL   -- unix millis
//! )
//! ```
//!
//! Upserts keep the greater timestamp (`MAX` on SQLite, `GREATEST` on MySQL),
//! so redelivered or reordered writes never move a key backwards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::persister::{FlushPolicy, Sink, SinkError};
use crate::resilience::{retry, RetryConfig};
use crate::write_back::KeyedSink;

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// One "key was used at" observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUsed {
    pub id: String,
    pub last_used_at: i64,
}

pub struct LastUsedSqlSink {
    pool: AnyPool,
    is_sqlite: bool,
}

impl LastUsedSqlSink {
    /// Connect with the startup retry preset and create the table if missing.
    pub async fn connect(connection_string: &str) -> Result<Self, SinkError> {
        install_drivers();
        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), &CancellationToken::new(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
        })
        .await?;

        let sink = Self { pool, is_sqlite };
        sink.init_schema().await?;
        info!(sqlite = is_sqlite, "Connected last-used SQL sink");
        Ok(sink)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), SinkError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS api_key_last_used (
                id TEXT PRIMARY KEY,
                last_used_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS api_key_last_used (
                id VARCHAR(255) PRIMARY KEY,
                last_used_at BIGINT NOT NULL
            )
            "#
        };
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO api_key_last_used (id, last_used_at) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET last_used_at = MAX(last_used_at, excluded.last_used_at)"
        } else {
            "INSERT INTO api_key_last_used (id, last_used_at) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE last_used_at = GREATEST(last_used_at, VALUES(last_used_at))"
        }
    }

    /// Stored timestamp for `id`, if any.
    pub async fn last_used(&self, id: &str) -> Result<Option<i64>, SinkError> {
        let row = sqlx::query("SELECT last_used_at FROM api_key_last_used WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("last_used_at")?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Sink<LastUsed> for LastUsedSqlSink {
    fn name(&self) -> &str {
        "api_key_last_used"
    }

    /// One transaction per batch.
    async fn write(&self, batch: &[LastUsed]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let sql = self.upsert_sql();
        let mut tx = self.pool.begin().await?;
        for entry in batch {
            sqlx::query(sql)
                .bind(entry.id.as_str())
                .bind(entry.last_used_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Lock timeouts are common under contention and clear up quickly.
    fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::retry_locally(3, Duration::from_millis(100), Duration::from_secs(2))
    }
}

#[async_trait]
impl KeyedSink<i64> for LastUsedSqlSink {
    async fn write_entry(&self, key: &str, value: &i64, _observed_at: i64) -> Result<(), SinkError> {
        sqlx::query(self.upsert_sql())
            .bind(key)
            .bind(*value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sink(dir: &TempDir) -> LastUsedSqlSink {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("last_used.db").display());
        LastUsedSqlSink::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_batch_upsert_keeps_greatest() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir).await;

        sink.write(&[
            LastUsed { id: "k1".into(), last_used_at: 200 },
            LastUsed { id: "k2".into(), last_used_at: 50 },
        ])
        .await
        .unwrap();

        // Older redelivery does not regress k1
        sink.write(&[LastUsed { id: "k1".into(), last_used_at: 100 }]).await.unwrap();

        assert_eq!(sink.last_used("k1").await.unwrap(), Some(200));
        assert_eq!(sink.last_used("k2").await.unwrap(), Some(50));
        assert_eq!(sink.last_used("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keyed_sink_write() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir).await;

        sink.write_entry("k1", &300, 300).await.unwrap();
        sink.write_entry("k1", &250, 250).await.unwrap();
        assert_eq!(sink.last_used("k1").await.unwrap(), Some(300));
        assert!(matches!(Sink::<LastUsed>::flush_policy(&sink), FlushPolicy::RetryLocally(_)));
    }
}
