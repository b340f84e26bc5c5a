//! Gateway wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. One connection is one node;
//! the endpoints it creates are multiplexed over the same socket and told
//! apart by `endpoint_id`.

use serde::{Deserialize, Serialize};

use crate::broker::id::{CopyId, EndpointId, MessageId};
use crate::broker::message::{Envelope, Payload, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStage {
    Received,
    Processed,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateEndpoint {
        request_id: u64,
        topic: String,
        subjects: Vec<String>,
    },
    CloseEndpoint {
        endpoint_id: EndpointId,
    },
    Send {
        topic: String,
        subjects: Vec<String>,
        #[serde(default)]
        target_kind: TargetKind,
        payload: Payload,
    },
    Ack {
        copy_id: CopyId,
        stage: AckStage,
    },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    EndpointCreated {
        request_id: u64,
        endpoint_id: EndpointId,
    },
    EndpointClosed {
        endpoint_id: EndpointId,
    },
    Sent {
        message_id: MessageId,
        fanout: usize,
    },
    Message {
        endpoint_id: EndpointId,
        copy_id: CopyId,
        envelope: Envelope,
    },
    Error {
        message: String,
    },
}
