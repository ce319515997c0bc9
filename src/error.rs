//! Error types for the kernel service.

use thiserror::Error;

/// Main error type for knoboo operations.
#[derive(Error, Debug)]
pub enum KnobooError {
    /// Kernel process could not be started.
    #[error("failed to spawn kernel: {0}")]
    Spawn(String),

    /// Credentials were rejected by every checker.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Authenticated user may not touch the requested notebook.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// No isolation slot is free in the user pool.
    #[error("engine pool exhausted ({0} slots in use)")]
    PoolExhausted(usize),

    /// Kernel process died unexpectedly.
    #[error("kernel process crashed: {0}")]
    ProcessCrashed(String),

    /// Malformed client message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Session with the given ID was not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Process with the given ID was not found.
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// Notebook is unknown to the notebook directory.
    #[error("notebook not found: {0}")]
    NotebookNotFound(String),

    /// Another writer already holds the notebook kernel in exclusive mode.
    #[error("notebook busy: {0}")]
    NotebookBusy(String),

    /// Viewer sessions cannot send input.
    #[error("session is read-only")]
    ReadOnly,

    /// Invalid session state transition attempted.
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// Invalid process state transition attempted.
    #[error("invalid process transition from {from:?} to {to:?}")]
    InvalidProcessTransition {
        from: crate::kernel::ProcessState,
        to: crate::kernel::ProcessState,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Channel receive side has gone away.
    #[error("channel closed")]
    ChannelClosed,

    /// Startup configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl KnobooError {
    /// Stable error code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "SPAWN_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Authorization(_) => "AUTHORIZATION_ERROR",
            Self::PoolExhausted(_) => "POOL_EXHAUSTED",
            Self::ProcessCrashed(_) => "PROCESS_CRASHED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            Self::NotebookNotFound(_) => "NOTEBOOK_NOT_FOUND",
            Self::NotebookBusy(_) => "NOTEBOOK_BUSY",
            Self::ReadOnly => "READ_ONLY",
            Self::InvalidStateTransition { .. } | Self::InvalidProcessTransition { .. } => {
                "INVALID_STATE"
            }
            Self::Io(_) | Self::LockPoisoned | Self::ChannelClosed | Self::Config(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted(_) | Self::NotebookBusy(_) | Self::ProcessCrashed(_)
        )
    }
}

/// Convenience Result type for knoboo operations.
pub type Result<T> = std::result::Result<T, KnobooError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = KnobooError::Spawn("no such file".into());
        assert!(err.to_string().contains("spawn"));
        assert!(err.to_string().contains("no such file"));
        assert_eq!(err.code(), "SPAWN_ERROR");
    }

    #[test]
    fn test_auth_codes() {
        assert_eq!(
            KnobooError::Authentication("bad secret".into()).code(),
            "AUTHENTICATION_ERROR"
        );
        assert_eq!(
            KnobooError::Authorization("nb1".into()).code(),
            "AUTHORIZATION_ERROR"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KnobooError = io_err.into();
        assert!(matches!(err, KnobooError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_retryable() {
        assert!(KnobooError::PoolExhausted(4).is_retryable());
        assert!(!KnobooError::Authentication("x".into()).is_retryable());
        assert!(!KnobooError::Protocol("x".into()).is_retryable());
    }

    #[test]
    fn test_pool_exhausted_display() {
        let err = KnobooError::PoolExhausted(3);
        assert!(err.to_string().contains("3 slots"));
    }
}
