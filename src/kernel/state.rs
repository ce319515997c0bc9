//! Kernel process lifecycle state.

use serde::Serialize;

/// Lifecycle state of a kernel process.
///
/// States only move forward: `Starting -> Running -> {Stopped, Failed}`.
/// A process that dies before it reaches `Running` goes straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawn requested, not yet confirmed.
    #[default]
    Starting,
    /// Process is up and accepting input.
    Running,
    /// Process was shut down on request.
    Stopped,
    /// Process could not start or died unexpectedly.
    Failed,
}

impl ProcessState {
    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (*self, target),
            (Starting, Running) | (Starting, Failed) | (Running, Stopped) | (Running, Failed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: ProcessState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::KnobooError::InvalidProcessTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}
