//! Client-facing session protocol.
//!
//! Every frame is one JSON object tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KnobooError;
use crate::kernel::ProcessId;
use crate::notebook::NotebookId;
use crate::realm::Credentials;
use crate::session::{Role, SessionId};

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame of every connection.
    Handshake {
        notebook_id: NotebookId,
        credentials: Credentials,
    },
    /// Code or command for the kernel.
    Input {
        /// Expected sequence number. Rejected when out of order.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        payload: Value,
    },
    /// Ask for a fresh kernel after the previous one died.
    Restart,
    Ping,
    Close,
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| KnobooError::Protocol(e.to_string()))
    }
}

/// Category of an envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Echo of a writer's input, seen by every session on the kernel.
    Input,
    #[default]
    Output,
    Error,
    Status,
}

/// One unit of notebook traffic delivered to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session whose request produced this payload.
    pub session_id: SessionId,
    /// Sequence number of that request, or 0 when it cannot be attributed.
    pub sequence: u64,
    pub kind: PayloadKind,
    pub payload: Value,
}

impl Envelope {
    pub fn new(session_id: SessionId, sequence: u64, kind: PayloadKind, payload: Value) -> Self {
        Self {
            session_id,
            sequence,
            kind,
            payload,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake (or restart) succeeded.
    Attached {
        session_id: SessionId,
        process_id: ProcessId,
        role: Role,
    },
    Envelope(Envelope),
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// Error frame for `err`, carrying its stable code.
    pub fn error(err: &KnobooError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Serialize to one text frame.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| KnobooError::Protocol(e.to_string()))
    }
}

impl From<Envelope> for ServerMessage {
    fn from(envelope: Envelope) -> Self {
        Self::Envelope(envelope)
    }
}
