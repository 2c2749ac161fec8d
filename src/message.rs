//!
//! This module defines the message entity shared by producers and consumers,
//! together with the result types a send operation produces.
//!

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum aggregate body size of one batch send, in bytes.
pub const MAX_BATCH_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Message {
    /// In the publisher-subscriber model, a topic is an address where messages
    /// are delivered to and subscribed from.
    pub topic: String,

    /// Coarse classification key used by tag filters. At most one per message.
    pub tag: Option<String>,

    /// Application-defined business key, e.g. an order id. Also used for
    /// partition placement when present.
    pub key: Option<String>,

    /// User defined attributes in form of key-value pairs.
    /// Attributes are evaluated by SQL filter expressions on the subscribing side.
    pub properties: HashMap<String, String>,

    /// Deferred-visibility bucket. Level 3 maps to a 10 second delay; see the
    /// broker's delay table for the full mapping. Mutually exclusive with batching.
    pub delay_level: Option<u8>,

    /// Whether the broker must confirm durable storage before acknowledging.
    pub wait_store_ok: bool,

    pub body: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Message {
            topic: topic.into(),
            tag: None,
            key: None,
            properties: HashMap::new(),
            delay_level: None,
            wait_store_ok: true,
            body: body.into(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach a user property, available to SQL filter predicates.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_delay_level(mut self, level: u8) -> Self {
        self.delay_level = Some(level);
        self
    }

    pub fn with_wait_store_ok(mut self, wait: bool) -> Self {
        self.wait_store_ok = wait;
        self
    }
}

/// A message as delivered to a consumer, carrying the broker-assigned metadata
/// that only exists once the message has been stored.
#[derive(Debug, Clone)]
pub struct MessageExt {
    pub message: Message,

    /// Broker-assigned identifier, unique per accepted message.
    pub message_id: String,

    /// Partition the message was stored in.
    pub queue_id: u32,

    /// Position within the partition.
    pub queue_offset: u64,

    /// Milliseconds since the epoch at submission time.
    pub born_timestamp: u64,

    /// Milliseconds since the epoch at store time.
    pub store_timestamp: u64,

    /// How many times this message has been redelivered to the group.
    pub reconsume_times: u32,
}

impl MessageExt {
    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn tag(&self) -> Option<&str> {
        self.message.tag.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.message.properties.get(key).map(String::as_str)
    }
}

/// Durability/replication outcome of an accepted send.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

/// Produced once per accepted message, or once per batch as an aggregate
/// (with the member ids joined by `,`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub status: SendStatus,
    pub message_id: String,
    pub queue_id: u32,
    pub queue_offset: u64,
}

/// Check a single message before it may leave the client: the topic is the
/// delivery address and must not be empty.
pub(crate) fn validate_message(message: &Message) -> Result<(), String> {
    if message.topic.is_empty() {
        return Err("message topic is empty".to_owned());
    }
    Ok(())
}

/// Check the invariants every batch send must satisfy before it may leave the
/// client: same topic, same durability flag, no schedule support, and an
/// aggregate body no larger than [`MAX_BATCH_BODY_BYTES`].
pub(crate) fn validate_batch(messages: &[Message]) -> Result<(), String> {
    let first = match messages.first() {
        Some(m) => m,
        None => return Err("batch is empty".to_owned()),
    };

    let mut total = 0usize;
    for message in messages {
        if message.topic.is_empty() {
            return Err("message topic is empty".to_owned());
        }
        if message.topic != first.topic {
            return Err(format!(
                "mixed topics in one batch: `{}` and `{}`",
                first.topic, message.topic
            ));
        }
        if message.wait_store_ok != first.wait_store_ok {
            return Err("mixed waitStoreOK flags in one batch".to_owned());
        }
        if message.delay_level.is_some() {
            return Err("batched messages do not support schedule".to_owned());
        }
        total += message.body.len();
    }

    if total > MAX_BATCH_BODY_BYTES {
        return Err(format!(
            "aggregate body size {} exceeds the {} byte limit",
            total, MAX_BATCH_BODY_BYTES
        ));
    }

    Ok(())
}
