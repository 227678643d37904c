//! Redis Streams bus provider.
//!
//! Mapping onto stream primitives:
//!
//! | bus concept        | redis                                           |
//! |--------------------|-------------------------------------------------|
//! | topic              | stream `{prefix}{topic}` + member of `{prefix}topics` |
//! | subscription       | consumer group (`XGROUP CREATE .. MKSTREAM`)    |
//! | publish            | `XADD` (`data` field + `attr:*` fields)         |
//! | pull               | reclaim idle pending (`XPENDING`/`XCLAIM`), then `XREADGROUP >` |
//! | ack                | `XACK`                                          |
//! | nack               | leave pending; reclaimed once idle past the ack deadline |
//! | extend deadline    | `XCLAIM .. JUSTID` (resets idle time)           |
//!
//! Blocking reads use their own connection so they never stall acks queued on
//! the command connection.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::BusError;
use super::message::{Message, OutgoingMessage};
use super::provider::BusProvider;
use crate::resilience::retry::{retry, RetryConfig};

const DATA_FIELD: &str = "data";
const ATTR_PREFIX: &str = "attr:";
/// Pending entries inspected per reclaim pass.
const RECLAIM_SCAN: usize = 100;
/// Longest single `XREADGROUP BLOCK`.
const MAX_BLOCK: Duration = Duration::from_secs(1);

pub struct RedisStreamBus {
    commands: ConnectionManager,
    reader: ConnectionManager,
    prefix: String,
    consumer: String,
    /// Ack deadline per `(topic, subscription)`, learned at creation or defaulted.
    deadlines: DashMap<(String, String), Duration>,
    default_ack_deadline: Duration,
}

impl RedisStreamBus {
    /// Connect with the startup retry preset; fails fast on a bad address.
    pub async fn connect(connection_string: &str, prefix: Option<&str>) -> Result<Self, BusError> {
        let client = Client::open(connection_string)?;
        let cancel = CancellationToken::new();

        let commands = retry("redis_bus_connect", &RetryConfig::startup(), &cancel, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;
        let reader = retry("redis_bus_connect_reader", &RetryConfig::startup(), &cancel, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        let consumer = format!("consumer-{}", uuid::Uuid::new_v4());
        info!(consumer = %consumer, "Connected Redis stream bus");

        Ok(Self {
            commands,
            reader,
            prefix: prefix.unwrap_or("").to_string(),
            consumer,
            deadlines: DashMap::new(),
            default_ack_deadline: Duration::from_secs(10),
        })
    }

    /// Consumer name used inside every group (unique per process).
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    #[inline]
    fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    #[inline]
    fn registry_key(&self) -> String {
        format!("{}topics", self.prefix)
    }

    fn ack_deadline(&self, topic: &str, subscription: &str) -> Duration {
        self.deadlines
            .get(&(topic.to_string(), subscription.to_string()))
            .map_or(self.default_ack_deadline, |d| *d)
    }

    fn to_message(entry: &StreamId, delivery_attempt: u32) -> Message {
        let payload: Vec<u8> = entry.get(DATA_FIELD).unwrap_or_default();
        let mut msg = Message::new(entry.id.clone(), payload)
            .with_publish_time(publish_time_from_id(&entry.id))
            .with_delivery_attempt(delivery_attempt);
        for (field, value) in &entry.map {
            if let Some(name) = field.strip_prefix(ATTR_PREFIX) {
                if let Ok(v) = redis::from_redis_value::<String>(value) {
                    msg.attributes.insert(name.to_string(), v);
                }
            }
        }
        msg
    }

    /// Claim entries of this group that sat unacked longer than the ack deadline.
    async fn reclaim_idle(
        &self,
        key: &str,
        subscription: &str,
        idle: Duration,
        max: usize,
    ) -> Result<Vec<Message>, BusError> {
        let mut con = self.commands.clone();
        let pending: StreamPendingCountReply = con
            .xpending_count(key, subscription, "-", "+", RECLAIM_SCAN)
            .await?;

        let idle_ms = idle.as_millis() as usize;
        let stale: HashMap<String, usize> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= idle_ms)
            .take(max)
            .map(|p| (p.id, p.times_delivered))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&String> = stale.keys().collect();
        let claimed: StreamClaimReply = con
            .xclaim(key, subscription, &self.consumer, idle_ms, &ids)
            .await?;
        debug!(stream = key, group = subscription, count = claimed.ids.len(), "Reclaimed idle entries");

        Ok(claimed
            .ids
            .iter()
            .map(|entry| {
                // XCLAIM bumped the counter past the value we read
                let attempt = stale.get(&entry.id).map_or(2, |n| (*n as u32).saturating_add(1));
                Self::to_message(entry, attempt)
            })
            .collect())
    }
}

/// Stream ids are `<unix-ms>-<seq>`.
fn publish_time_from_id(id: &str) -> SystemTime {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<u64>().ok())
        .map_or_else(SystemTime::now, |ms| UNIX_EPOCH + Duration::from_millis(ms))
}

#[async_trait]
impl BusProvider for RedisStreamBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        let mut con = self.commands.clone();
        Ok(con.sismember(self.registry_key(), topic).await?)
    }

    async fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        let mut con = self.commands.clone();
        let added: i64 = con.sadd(self.registry_key(), topic).await?;
        if added == 0 {
            return Err(BusError::AlreadyExists(topic.to_string()));
        }
        Ok(())
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BusError> {
        let key = self.stream_key(topic);
        let mut con = self.commands.clone();
        let exists: bool = con.exists(&key).await?;
        if !exists {
            return Ok(false);
        }
        let info: StreamInfoGroupsReply = con.xinfo_groups(&key).await?;
        Ok(info.groups.iter().any(|g| g.name == subscription))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        ack_deadline: Duration,
    ) -> Result<(), BusError> {
        if !self.topic_exists(topic).await? {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        let key = self.stream_key(topic);
        let mut con = self.commands.clone();
        let created: redis::RedisResult<()> = con.xgroup_create_mkstream(&key, subscription, "0").await;
        match created {
            Ok(()) => {
                self.deadlines
                    .insert((topic.to_string(), subscription.to_string()), ack_deadline);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                Err(BusError::AlreadyExists(subscription.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, BusError> {
        let mut fields: Vec<(String, Vec<u8>)> = Vec::with_capacity(message.attributes.len() + 1);
        fields.push((DATA_FIELD.to_string(), message.payload));
        for (k, v) in message.attributes {
            fields.push((format!("{ATTR_PREFIX}{k}"), v.into_bytes()));
        }
        let mut con = self.commands.clone();
        let id: String = con.xadd(self.stream_key(topic), "*", &fields).await?;
        Ok(id)
    }

    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, BusError> {
        let key = self.stream_key(topic);
        let max = max_messages.max(1);

        let reclaimed = self
            .reclaim_idle(&key, subscription, self.ack_deadline(topic, subscription), max)
            .await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let mut opts = StreamReadOptions::default().group(subscription, &self.consumer).count(max);
        let block = wait.min(MAX_BLOCK);
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        let mut con = self.reader.clone();
        let reply: Option<StreamReadReply> = con.xread_options(&[&key], &[">"], &opts).await?;
        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|entry| Self::to_message(&entry, 1))
            .collect())
    }

    async fn ack(&self, topic: &str, subscription: &str, ids: &[String]) -> Result<(), BusError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut con = self.commands.clone();
        let _: i64 = con.xack(self.stream_key(topic), subscription, ids).await?;
        Ok(())
    }

    async fn nack(&self, _topic: &str, _subscription: &str, ids: &[String]) -> Result<(), BusError> {
        // Entries stay in the pending list; reclaim_idle hands them out again
        debug!(count = ids.len(), "Nacked entries left pending for reclaim");
        Ok(())
    }

    async fn extend_deadline(
        &self,
        topic: &str,
        subscription: &str,
        ids: &[String],
        _deadline: Duration,
    ) -> Result<(), BusError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut con = self.commands.clone();
        let opts = StreamClaimOptions::default().with_justid();
        let _: redis::Value = con
            .xclaim_options(self.stream_key(topic), subscription, &self.consumer, 0, ids, opts)
            .await?;
        Ok(())
    }
}
