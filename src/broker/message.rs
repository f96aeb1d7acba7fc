//! Message definitions for the broker
//!
//! `Message` is the canonical internal and peer-to-peer representation. Once
//! published it is wrapped in an `Arc` and shared read-only by every mailbox it
//! is delivered to.
//!
//! Notes on fields:
//! - `id`: unique identifier, also used by the dispatcher to recognise messages
//!   that arrived from a peer
//! - `topic`: topic name used for routing
//! - `type`: application-defined tag, or one of the reserved kinds below
//! - `payload`: opaque JSON body

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::broker::topic::Topic;
use crate::processor::ProcessorId;

pub const TOPIC_DELETED_TYPE: &str = "deleteTopicMessageType";
pub const SUBSCRIPTION_TYPE: &str = "subscriptionMessageType";
pub const UNSUBSCRIPTION_TYPE: &str = "unsubscriptionMessageType";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Draw a fresh id from the top 63 bits of a v4 UUID, so ids stay positive
    /// and do not collide between nodes in practice.
    pub fn generate() -> Self {
        Self((Uuid::new_v4().as_u128() >> 65) as i64)
    }

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: Topic,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Direction of a subscription notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Subscribed,
    Unsubscribed,
}

/// Payload of the notifications published on the reserved topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub topic: Topic,
    pub processor: ProcessorId,
}

impl Message {
    pub fn new(topic: impl Into<Topic>, kind: impl Into<String>, payload: Value) -> Self {
        Self::with_id(MessageId::generate(), topic, kind, payload)
    }

    pub fn with_id(
        id: MessageId,
        topic: impl Into<Topic>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            kind: kind.into(),
            payload,
        }
    }

    /// Notice sent to each subscriber of `topic` right before it is removed.
    pub fn topic_deleted(topic: &Topic) -> Self {
        Self::new(topic, TOPIC_DELETED_TYPE, json!({ "topic": topic }))
    }

    pub fn subscription_changed(change: ChangeKind, topic: &Topic, processor: &str) -> Self {
        let (channel, kind) = match change {
            ChangeKind::Subscribed => (Topic::subscriptions(), SUBSCRIPTION_TYPE),
            ChangeKind::Unsubscribed => (Topic::unsubscriptions(), UNSUBSCRIPTION_TYPE),
        };
        let payload = json!({ "topic": topic, "processor": processor });
        Self::new(channel, kind, payload)
    }

    pub fn is_topic_deleted(&self) -> bool {
        self.kind == TOPIC_DELETED_TYPE
    }

    /// Decode a subscription notification. Returns `None` for any other message.
    pub fn subscription_change(&self) -> Option<(ChangeKind, SubscriptionChange)> {
        let change = match self.kind.as_str() {
            SUBSCRIPTION_TYPE => ChangeKind::Subscribed,
            UNSUBSCRIPTION_TYPE => ChangeKind::Unsubscribed,
            _ => return None,
        };
        let body = serde_json::from_value(self.payload.clone()).ok()?;
        Some((change, body))
    }
}
