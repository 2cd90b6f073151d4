//! Connection state machine.
//!
//! The legal edges are:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Streaming
//!                     |             |
//!                     +-> Disconnected <-+
//! ```
//!
//! `Streaming` can only be entered from `Connected` and only left towards
//! `Connected`, so a disconnect while streaming always passes through
//! `Connected` first.

use std::collections::VecDeque;
use std::fmt;

use crate::error::CameraError;

/// Number of transitions remembered by [`StateMachine::history`].
const HISTORY_LIMIT: usize = 64;

/// Lifecycle state of the camera connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraState {
    /// No device handle is held.
    #[default]
    Disconnected,
    /// `open` is in progress.
    Connecting,
    /// Device is open and idle.
    Connected,
    /// Device is open and the acquisition loop is running.
    Streaming,
}

impl CameraState {
    /// Whether a device handle is held in this state.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }

    const fn can_enter(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Streaming | Self::Disconnected)
                | (Self::Streaming, Self::Connected)
        )
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Attempted edge that is not part of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal state transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State before the attempted transition.
    pub from: CameraState,
    /// Requested target state.
    pub to: CameraState,
}

impl From<InvalidTransition> for CameraError {
    fn from(err: InvalidTransition) -> Self {
        Self::InvalidState {
            operation: "change state",
            state: err.from,
        }
    }
}

/// Current state plus a bounded record of the states visited.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: CameraState,
    history: VecDeque<CameraState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a machine in [`CameraState::Disconnected`].
    pub fn new() -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LIMIT);
        history.push_back(CameraState::Disconnected);
        Self {
            state: CameraState::Disconnected,
            history,
        }
    }

    /// Current state.
    pub const fn state(&self) -> CameraState {
        self.state
    }

    /// Move to `to`, rejecting edges the machine does not allow.
    pub fn transition(&mut self, to: CameraState) -> Result<(), InvalidTransition> {
        if !self.state.can_enter(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = %self.state, %to, "state transition");
        self.state = to;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(to);
        Ok(())
    }

    /// States visited, oldest first, including the current one.
    pub fn history(&self) -> Vec<CameraState> {
        self.history.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut machine = StateMachine::new();
        for to in [
            CameraState::Connecting,
            CameraState::Connected,
            CameraState::Streaming,
            CameraState::Connected,
            CameraState::Disconnected,
        ] {
            machine.transition(to).expect("legal transition");
        }
        assert_eq!(machine.state(), CameraState::Disconnected);
        assert_eq!(machine.history().len(), 6);
    }

    #[test]
    fn test_streaming_requires_connected() {
        let mut machine = StateMachine::new();
        let err = machine
            .transition(CameraState::Streaming)
            .expect_err("cannot stream while disconnected");
        assert_eq!(err.from, CameraState::Disconnected);

        machine.transition(CameraState::Connecting).expect("legal");
        assert!(machine.transition(CameraState::Streaming).is_err());
    }

    #[test]
    fn test_streaming_cannot_jump_to_disconnected() {
        let mut machine = StateMachine::new();
        machine.transition(CameraState::Connecting).expect("legal");
        machine.transition(CameraState::Connected).expect("legal");
        machine.transition(CameraState::Streaming).expect("legal");
        assert!(machine.transition(CameraState::Disconnected).is_err());
        assert_eq!(machine.state(), CameraState::Streaming);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = StateMachine::new();
        machine.transition(CameraState::Connecting).expect("legal");
        machine.transition(CameraState::Connected).expect("legal");
        for _ in 0..100 {
            machine.transition(CameraState::Streaming).expect("legal");
            machine.transition(CameraState::Connected).expect("legal");
        }
        let history = machine.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last(), Some(&CameraState::Connected));
    }

    #[test]
    fn test_is_connected() {
        assert!(!CameraState::Disconnected.is_connected());
        assert!(!CameraState::Connecting.is_connected());
        assert!(CameraState::Connected.is_connected());
        assert!(CameraState::Streaming.is_connected());
    }
}
