//! Framing between the service and a kernel process.
//!
//! With [`Framing::Json`] each request is written as
//! `{"id": <tag>, "payload": ...}` and replies are read as
//! `{"id": <tag>, "kind": "...", "payload": ...}`. Lines that are not such
//! objects are attributed to the most recent request.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PayloadKind;
use crate::error::KnobooError;
use crate::kernel::{Framing, KernelOutput, OutputStream};
use crate::session::SessionId;
use crate::Result;

/// Upper bound on remembered request tags per kernel.
pub const MAX_TRACKED_REQUESTS: usize = 1024;

#[derive(Serialize)]
struct KernelRequest<'a> {
    id: u64,
    payload: &'a Value,
}

#[derive(Deserialize)]
struct KernelReplyFrame {
    id: Option<u64>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Encode one request as a newline-terminated frame.
pub fn encode_request(framing: Framing, tag: u64, payload: &Value) -> Result<Vec<u8>> {
    let mut frame = match framing {
        Framing::Json => serde_json::to_vec(&KernelRequest { id: tag, payload })
            .map_err(|e| KnobooError::Protocol(e.to_string()))?,
        Framing::Raw => match payload {
            Value::String(text) => text.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        },
    };
    frame.push(b'\n');
    Ok(frame)
}

/// One decoded line of kernel output.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelReply {
    /// Request tag the kernel attributed this line to.
    pub tag: Option<u64>,
    pub kind: PayloadKind,
    pub payload: Value,
}

/// Decode one line of kernel output.
///
/// Stderr lines are always untagged errors.
pub fn decode_reply(framing: Framing, output: &KernelOutput) -> KernelReply {
    let text = output.text();
    if output.stream == OutputStream::Stderr {
        return KernelReply {
            tag: None,
            kind: PayloadKind::Error,
            payload: Value::String(text),
        };
    }

    if framing == Framing::Json {
        if let Ok(frame) = serde_json::from_slice::<KernelReplyFrame>(&output.line) {
            if frame.id.is_some() || frame.kind.is_some() {
                return KernelReply {
                    tag: frame.id,
                    kind: frame.kind.as_deref().map(parse_kind).unwrap_or_default(),
                    payload: frame.payload,
                };
            }
        }
    }

    KernelReply {
        tag: None,
        kind: PayloadKind::Output,
        payload: Value::String(text),
    }
}

fn parse_kind(kind: &str) -> PayloadKind {
    match kind {
        "error" | "stderr" | "exception" => PayloadKind::Error,
        "status" => PayloadKind::Status,
        "input" => PayloadKind::Input,
        _ => PayloadKind::Output,
    }
}

/// Origin of one kernel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOrigin {
    pub session: SessionId,
    pub sequence: u64,
}

/// Tag allocator mapping kernel request tags back to sessions.
#[derive(Debug, Default)]
pub struct RequestTags {
    next: u64,
    origins: HashMap<u64, RequestOrigin>,
    order: VecDeque<u64>,
    last: Option<u64>,
}

impl RequestTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a tag for a request from `session` with `sequence`.
    pub fn register(&mut self, session: SessionId, sequence: u64) -> u64 {
        self.next += 1;
        let tag = self.next;
        self.origins.insert(tag, RequestOrigin { session, sequence });
        self.order.push_back(tag);
        self.last = Some(tag);

        while self.order.len() > MAX_TRACKED_REQUESTS {
            if let Some(old) = self.order.pop_front() {
                self.origins.remove(&old);
            }
        }
        tag
    }

    /// Origin of `tag`, or of the latest request when the line is untagged.
    pub fn resolve(&self, tag: Option<u64>) -> Option<RequestOrigin> {
        let tag = tag.or(self.last)?;
        self.origins.get(&tag).copied()
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
