//! Client-facing listeners.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/v1/` - Service information
//! - `WS /ws` - Session protocol
//!
//! ### Admin (bearer token with process management rights)
//! - `GET /api/v1/processes` - List kernel processes
//! - `DELETE /api/v1/processes/{id}` - Stop a kernel process
//! - `GET /api/v1/sessions` - List open sessions
//!
//! The same session protocol is also served as newline-delimited JSON over
//! plain TCP by [`serve_direct`].

pub mod auth;
pub mod connection;
pub mod direct;
pub mod handlers;
pub mod router;
pub mod types;
pub mod websocket;

pub use auth::{require_admin, PeerAddr};
pub use connection::{Connection, ConnectionConfig, Flow, DEFAULT_MAX_FRAME_BYTES};
pub use direct::serve_direct;
pub use router::{create_router, create_router_at, serve, AppState, ServerConfig};
pub use types::{ErrorResponse, ListProcessesResponse, ListSessionsResponse, StopProcessResponse};
