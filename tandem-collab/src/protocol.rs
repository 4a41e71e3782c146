//! JSON wire protocol shared by the sync server and clients.
//!
//! Every frame is one JSON object discriminated by `type`:
//! ```text
//! {"type":"init",   "content":[u8..], "collaborators":[String..]}   server → joining client
//! {"type":"join",   "userId":String}                                server → other clients
//! {"type":"leave",  "userId":String}                                server → other clients
//! {"type":"update", "data":[u8..],    "userId":String}              both directions
//! ```
//!
//! Byte arrays are plain JSON integer arrays; any element outside `0..=255`
//! makes the frame malformed. Frames may arrive as text or binary
//! WebSocket messages, binary frames carrying the same UTF-8 JSON.

use serde::{Deserialize, Serialize};
use tandem_core::ErrorKind;
use thiserror::Error;

/// Literal keep-alive text frame, answered with [`PONG`].
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Full document state plus everyone currently joined (including the
    /// recipient). Sent once, to a newly joined session only.
    Init {
        content: Vec<u8>,
        collaborators: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Join { user_id: String },
    #[serde(rename_all = "camelCase")]
    Leave { user_id: String },
    /// A delta or full-state blob attributed to its originator.
    #[serde(rename_all = "camelCase")]
    Update { data: Vec<u8>, user_id: String },
}

impl WireMessage {
    pub fn init(content: Vec<u8>, collaborators: Vec<String>) -> Self {
        WireMessage::Init {
            content,
            collaborators,
        }
    }

    pub fn join(user_id: impl Into<String>) -> Self {
        WireMessage::Join {
            user_id: user_id.into(),
        }
    }

    pub fn leave(user_id: impl Into<String>) -> Self {
        WireMessage::Leave {
            user_id: user_id.into(),
        }
    }

    pub fn update(data: Vec<u8>, user_id: impl Into<String>) -> Self {
        WireMessage::Update {
            data,
            user_id: user_id.into(),
        }
    }

    /// Tag value as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Init { .. } => "init",
            WireMessage::Join { .. } => "join",
            WireMessage::Leave { .. } => "leave",
            WireMessage::Update { .. } => "update",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// Parse a JSON frame from a text payload.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::decode_bytes(text.as_bytes())
    }

    /// Parse a JSON frame from raw bytes (binary WebSocket message).
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// An `update` frame received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUpdate {
    pub data: Vec<u8>,
    pub user_id: String,
}

/// Decode a client→server frame. Only `update` is accepted in this direction.
pub fn decode_inbound(text: &str) -> Result<InboundUpdate, ProtocolError> {
    match WireMessage::decode(text)? {
        WireMessage::Update { data, user_id } => Ok(InboundUpdate { data, user_id }),
        other => Err(ProtocolError::UnexpectedType(other.type_name())),
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Undecodable or schema-invalid frame
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed frame of a type not accepted in this direction
    #[error("unexpected message type '{0}'")]
    UnexpectedType(&'static str),
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedMessage
    }
}
