//! Wire formats: the client session protocol and kernel stdio framing.

mod kernel;
mod message;

pub use kernel::{
    decode_reply, encode_request, KernelReply, RequestOrigin, RequestTags, MAX_TRACKED_REQUESTS,
};
pub use message::{ClientMessage, Envelope, PayloadKind, ServerMessage};
