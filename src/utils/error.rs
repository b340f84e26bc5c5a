//! The `error` module defines the error type shared by every `fanmq` module.
//!
//! Routing errors are reported synchronously to the sending node and mean
//! nothing was enqueued. Delivery problems for single endpoints under
//! `Available` fan-out are not errors at all; they are logged and skipped.

use crate::broker::id::{EndpointId, MessageId, NodeId};
use crate::broker::message::PayloadKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),

    #[error("unknown topic {0:?}")]
    UnknownTopic(String),

    #[error("topic {0:?} already exists")]
    TopicExists(String),

    #[error("malformed subject {0:?}")]
    MalformedSubject(String),

    #[error("at least one subject is required")]
    NoSubjects,

    #[error("endpoint {0} cannot accept delivery")]
    TargetRejected(EndpointId),

    #[error("endpoint {endpoint} on topic {topic:?} has no free slots")]
    Backpressure { topic: String, endpoint: EndpointId },

    #[error("{failed} of {expected} copies of message {message} were not acknowledged")]
    Undelivered {
        message: MessageId,
        expected: usize,
        failed: usize,
    },

    #[error("timed out waiting for queue slots on topic {0:?}")]
    SendTimeout(String),

    #[error("node {0} is disconnected")]
    NodeDisconnected(NodeId),

    #[error("expected a {expected:?} payload, found {found:?}")]
    PayloadKind {
        expected: PayloadKind,
        found: PayloadKind,
    },

    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
