//! The `error` module defines the error types used within `relayhub`.
//!
//! Each layer owns one enum: `HubError` for broker bookkeeping,
//! `ProcessorError` for transport-local delivery failures, `DispatchError` for
//! cross-node forwarding and the peer store, and `ServerError` for startup.

use std::time::Duration;

use thiserror::Error;

use crate::broker::topic::Topic;
use crate::processor::ProcessorId;

/// Failures of broker operations. All of them are caller-input errors apart
/// from `Storage`, `Closed` and `CloseFailed`; none of them is retried by the
/// broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("topic {0} does not exist")]
    TopicNotFound(Topic),

    #[error("topic {0} already exists")]
    TopicAlreadyExists(Topic),

    #[error("topic {0} is reserved by the broker")]
    ReservedTopic(Topic),

    #[error("processor {0} is not registered")]
    ProcessorNotRegistered(ProcessorId),

    #[error("processor {0} is already registered")]
    ProcessorAlreadyRegistered(ProcessorId),

    #[error("processor {processor} has already subscribed to topic {topic}")]
    AlreadySubscribed { processor: ProcessorId, topic: Topic },

    #[error("processor {processor} has not subscribed to topic {topic}")]
    NotSubscribed { processor: ProcessorId, topic: Topic },

    #[error("topic store error: {0}")]
    Storage(String),

    #[error("broker is closed")]
    Closed,

    #[error("failed to unregister {} processor(s) while closing the broker", .0.len())]
    CloseFailed(Vec<(ProcessorId, HubError)>),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("transport is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to peer {peer} failed: {source}")]
    Request {
        peer: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("peer {peer} says the request was malformed")]
    Rejected { peer: String },

    #[error("peer {peer} had an error handling the message")]
    PeerFailure { peer: String },

    #[error("peer store error: {0}")]
    Store(#[from] sled::Error),

    #[error("failed to encode peer record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Hub(#[from] HubError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
