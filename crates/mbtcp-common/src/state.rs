//! Server lifecycle state machine.
//!
//! STOPPED → RUNNING → STOPPING → STOPPED
//!
//! A stopped server may be started again; every other transition is rejected.

use crate::error::{MbError, MbResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a responder server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    /// Not accepting connections; no sessions alive.
    #[default]
    Stopped,
    /// Accept loop running, sessions being served.
    Running,
    /// Stop requested; waiting for the accept loop and sessions to exit.
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
        }
    }
}

impl ServerState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ServerState) -> bool {
        use ServerState::{Running, Stopped, Stopping};

        matches!(
            (self, target),
            (Stopped, Running) | (Running, Stopping) | (Stopping, Stopped)
        )
    }

    /// Attempt to transition to `target`, returning error if invalid.
    pub fn transition_to(&mut self, target: ServerState) -> MbResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(MbError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true while the accept loop should keep serving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}
