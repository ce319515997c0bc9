//! Session management module.
//!
//! A session is one authenticated client attached to one notebook kernel.
//! This module provides session identification, the session state
//! machine, the per-kernel route that fans kernel output out to every
//! attached session, and the manager tying sessions to the process
//! manager.

mod client;
mod id;
mod manager;
mod route;
mod state;
mod store;

pub use client::{Role, Session};
pub use id::SessionId;
pub use manager::{Attachment, SessionInfo, SessionManager, SessionManagerConfig, Sharing};
pub use route::{KernelRoute, Outbound};
pub use state::SessionState;
pub use store::{SessionHandle, SessionStore};
