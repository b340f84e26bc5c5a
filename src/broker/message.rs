//! Message definitions for the broker
//!
//! `Envelope` is the unit a node hands to the router. It is immutable once
//! built and is shared (behind an `Arc`) by every copy the router fans out,
//! so a broadcast to a hundred endpoints does not clone the payload.
//!
//! Notes on fields:
//! - `topic`: subscription namespace used for routing
//! - `subjects`: routing keys; an endpoint matches when it subscribed to at
//!   least one of them
//! - `target_kind`: fan-out policy, see [`TargetKind`]
//! - `payload`: opaque bytes plus a [`PayloadKind`] tag; the broker never
//!   looks inside
//! - `timestamp`: milliseconds since UNIX epoch, set when the envelope is built

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::broker::id::{MessageId, NodeId};
use crate::utils::error::{Error, Result};

/// Which subset of the matching endpoints receives an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Best effort: every matching endpoint that can accept right now.
    #[default]
    Available,
    /// Strict: every matching endpoint must accept, or the send fails.
    All,
}

/// Discriminator for the payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    #[default]
    Json,
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub kind: PayloadKind,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self {
            kind: PayloadKind::Json,
            data: serde_json::to_vec(value)?,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            data: text.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            data: data.into(),
        }
    }

    /// Decodes a JSON payload. Fails with [`Error::PayloadKind`] for other kinds.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.kind != PayloadKind::Json {
            return Err(Error::PayloadKind {
                expected: PayloadKind::Json,
                found: self.kind,
            });
        }
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub topic: String,
    pub subjects: Vec<String>,
    pub target_kind: TargetKind,
    pub payload: Payload,
    pub sender: Option<NodeId>,
    pub timestamp: i64,
}

impl Envelope {
    /// Builds an envelope with a fresh id. The sender is stamped by the node
    /// that sends it.
    pub fn new<S>(
        topic: impl Into<String>,
        subjects: impl IntoIterator<Item = S>,
        target_kind: TargetKind,
        payload: Payload,
    ) -> Self
    where
        S: Into<String>,
    {
        Self {
            id: MessageId::new(),
            topic: topic.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            target_kind,
            payload,
            sender: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Checks the topic name and every subject before routing.
    pub fn validate(&self) -> Result<()> {
        validate_topic(&self.topic)?;
        validate_subjects(&self.subjects)
    }
}

/// Topic names are non-empty and contain no whitespace or control characters.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Subjects are `/`-separated keys such as `event/test_broadcast`. Empty
/// segments (`a//b`, `/a`, `a/`) and whitespace are rejected.
pub fn validate_subject(subject: &str) -> Result<()> {
    let malformed = subject.is_empty()
        || subject.split('/').any(str::is_empty)
        || subject.chars().any(|c| c.is_whitespace() || c.is_control());
    if malformed {
        return Err(Error::MalformedSubject(subject.to_string()));
    }
    Ok(())
}

pub fn validate_subjects<S: AsRef<str>>(subjects: &[S]) -> Result<()> {
    if subjects.is_empty() {
        return Err(Error::NoSubjects);
    }
    subjects.iter().try_for_each(|s| validate_subject(s.as_ref()))
}
