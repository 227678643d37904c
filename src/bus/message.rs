// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Messages moving through the bus.
//!
//! A [`Message`] pulled by a [`Puller`](super::Puller) carries an ack handle.
//! Ownership of the message is ownership of the decision: [`Message::ack`] and
//! [`Message::nack`] consume it, and dropping an unsettled message nacks it so
//! a panicking worker or an abandoned batch never leaks flow-control capacity
//! and never loses data (the bus redelivers).

use serde::Serialize;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Attribute used to identify the logical entity a message refers to.
pub const ID_ATTRIBUTE: &str = "id";

/// Settlement sent from a message back to its puller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckReply {
    Ack(String),
    Nack(String),
}

/// Links a pulled message to its puller's ack loop and flow-control budget.
#[derive(Debug)]
pub(crate) struct AckHandle {
    replies: mpsc::UnboundedSender<AckReply>,
    _message_permit: OwnedSemaphorePermit,
    byte_permit: Option<OwnedSemaphorePermit>,
}

impl AckHandle {
    pub(crate) fn new(replies: mpsc::UnboundedSender<AckReply>, message_permit: OwnedSemaphorePermit) -> Self {
        Self {
            replies,
            _message_permit: message_permit,
            byte_permit: None,
        }
    }
}

/// A message received from a subscription.
#[derive(Debug)]
pub struct Message {
    pub id: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: SystemTime,
    /// 1 on first delivery; providers that cannot count report at least 2 for redeliveries
    pub delivery_attempt: u32,
    handle: Option<AckHandle>,
}

impl Message {
    /// A detached message (no ack handle). Providers build these; the puller attaches handles.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            attributes: HashMap::new(),
            publish_time: SystemTime::now(),
            delivery_attempt: 1,
            handle: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_publish_time(mut self, publish_time: SystemTime) -> Self {
        self.publish_time = publish_time;
        self
    }

    #[must_use]
    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// The `id` attribute if present and non-empty.
    pub fn entity_id(&self) -> Option<&str> {
        self.attributes
            .get(ID_ATTRIBUTE)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Key used to collapse duplicates within a batch.
    pub fn dedupe_key(&self) -> &str {
        self.entity_id().unwrap_or(&self.id)
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn attach(mut self, handle: AckHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub(crate) fn attach_byte_permit(&mut self, permit: OwnedSemaphorePermit) {
        if let Some(handle) = self.handle.as_mut() {
            handle.byte_permit = Some(permit);
        }
    }

    /// Processing succeeded; the bus will not redeliver.
    pub fn ack(mut self) {
        self.settle(true);
    }

    /// Processing failed; the bus redelivers later.
    pub fn nack(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, ok: bool) {
        if let Some(handle) = self.handle.take() {
            let id = std::mem::take(&mut self.id);
            let reply = if ok { AckReply::Ack(id) } else { AckReply::Nack(id) };
            if handle.replies.send(reply).is_err() {
                debug!("Ack loop gone, settlement dropped (bus will redeliver)");
            }
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(id = %self.id, "Unsettled message dropped, nacking");
            self.settle(false);
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            attributes: HashMap::new(),
        }
    }

    /// JSON-encode `value` as the payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_id(self, id: impl Into<String>) -> Self {
        self.with_attribute(ID_ATTRIBUTE, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn attached(id: &str) -> (Message, mpsc::UnboundedReceiver<AckReply>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(1));
        let permit = permits.clone().try_acquire_owned().unwrap();
        let msg = Message::new(id, b"payload".to_vec()).attach(AckHandle::new(tx, permit));
        (msg, rx, permits)
    }

    #[test]
    fn test_ack_sends_reply_and_releases_permit() {
        let (msg, mut rx, permits) = attached("m1");
        assert_eq!(permits.available_permits(), 0);

        msg.ack();
        assert_eq!(rx.try_recv().unwrap(), AckReply::Ack("m1".into()));
        assert_eq!(permits.available_permits(), 1);
    }

    #[test]
    fn test_drop_unsettled_nacks() {
        let (msg, mut rx, permits) = attached("m2");
        drop(msg);
        assert_eq!(rx.try_recv().unwrap(), AckReply::Nack("m2".into()));
        assert_eq!(permits.available_permits(), 1);
    }

    #[test]
    fn test_settle_happens_once() {
        let (msg, mut rx, _permits) = attached("m3");
        msg.nack();
        assert_eq!(rx.try_recv().unwrap(), AckReply::Nack("m3".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_detached_message_settles_silently() {
        let msg = Message::new("free", Vec::new());
        assert!(!msg.is_attached());
        msg.ack();
    }

    #[test]
    fn test_dedupe_key_prefers_id_attribute() {
        let msg = Message::new("bus-1", Vec::new()).with_attribute(ID_ATTRIBUTE, "key-9");
        assert_eq!(msg.dedupe_key(), "key-9");

        let empty = Message::new("bus-2", Vec::new()).with_attribute(ID_ATTRIBUTE, "");
        assert_eq!(empty.entity_id(), None);
        assert_eq!(empty.dedupe_key(), "bus-2");
    }

    #[test]
    fn test_outgoing_json() {
        #[derive(Serialize)]
        struct Usage {
            key: &'static str,
        }
        let out = OutgoingMessage::json(&Usage { key: "k1" }).unwrap().with_id("k1");
        assert_eq!(out.payload, br#"{"key":"k1"}"#.to_vec());
        assert_eq!(out.attributes.get(ID_ATTRIBUTE).map(String::as_str), Some("k1"));
    }
}
