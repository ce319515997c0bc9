//! Session state machine.

use serde::Serialize;

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection accepted, credentials not yet checked.
    #[default]
    Connecting,
    /// Credentials accepted, no kernel bound yet.
    Authenticated,
    /// Bound to a notebook kernel and routing traffic.
    Active,
    /// Tear-down in progress.
    Closing,
    /// Finished. No further transitions.
    Closed,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Connecting -> Authenticated
    /// - Connecting -> Closed (authentication failed)
    /// - Authenticated -> Active
    /// - Active -> Closing
    /// - Closing -> Closed
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: SessionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::KnobooError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Check if the session routes traffic.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }
}
