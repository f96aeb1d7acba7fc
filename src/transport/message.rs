use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::{Message, MessageId};

/// Control frames a WebSocket client sends to manage its own subscriptions.
/// No acknowledgement is sent back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "SUB")]
    Subscribe { topic: String },

    #[serde(rename = "UNSUB")]
    Unsubscribe { topic: String },
}

/// Shape of every message pushed to a client, over either transport.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub id: MessageId,
    pub message: &'a Value,
}

impl<'a> From<&'a Message> for Envelope<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            kind: &message.kind,
            id: message.id,
            message: &message.payload,
        }
    }
}

/// Encode `message` as one JSON envelope, without a trailing newline.
pub fn encode(message: &Message) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope::from(message))
}
