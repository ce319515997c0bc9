//! Admin API request and response types.

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::KnobooError;
use crate::kernel::{ProcessId, ProcessState};
use crate::procman::ProcessInfo;
use crate::session::SessionInfo;

/// Generic API error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "PROCESS_NOT_FOUND").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    /// Map a service error to its HTTP status and body.
    pub fn from_error(err: &KnobooError) -> ApiError {
        (status_for(err), Json(Self::new(err.code(), err.to_string())))
    }
}

/// HTTP status for a service error.
pub fn status_for(err: &KnobooError) -> StatusCode {
    match err {
        KnobooError::Authentication(_) => StatusCode::UNAUTHORIZED,
        KnobooError::Authorization(_) | KnobooError::ReadOnly => StatusCode::FORBIDDEN,
        KnobooError::SessionNotFound(_)
        | KnobooError::ProcessNotFound(_)
        | KnobooError::NotebookNotFound(_) => StatusCode::NOT_FOUND,
        KnobooError::NotebookBusy(_)
        | KnobooError::InvalidStateTransition { .. }
        | KnobooError::InvalidProcessTransition { .. } => StatusCode::CONFLICT,
        KnobooError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        KnobooError::Protocol(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// List processes response.
#[derive(Debug, Clone, Serialize)]
pub struct ListProcessesResponse {
    pub count: usize,
    pub processes: Vec<ProcessInfo>,
}

/// Response for a stopped process.
#[derive(Debug, Clone, Serialize)]
pub struct StopProcessResponse {
    pub process_id: ProcessId,
    pub state: ProcessState,
}

/// List sessions response.
#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionInfo>,
}
