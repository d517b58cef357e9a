//! Component lifecycle.
//!
//! Nodes, graphs and engines all move through the same states:
//!
//! ```text
//! Uninitialised -> Initialised -> Starting -> Started -> Stopping -> Stopped -> Disposed
//!                                     ^                                  |
//!                                     +----------------------------------+
//! ```
//!
//! A stopped component may be started again; disposal is terminal. A
//! component whose start failed part-way can still be stopped.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialised,
    Initialised,
    Starting,
    Started,
    Stopping,
    Stopped,
    Disposed,
}

impl LifecycleState {
    pub fn is_started(self) -> bool {
        self == Self::Started
    }

    pub fn is_starting(self) -> bool {
        self == Self::Starting
    }

    pub fn is_stopping(self) -> bool {
        self == Self::Stopping
    }

    /// Started or in the middle of starting.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Started)
    }

    /// Validate a transition, returning the new state.
    pub fn transition(self, to: Self) -> Result<Self> {
        use LifecycleState::*;
        let allowed = matches!(
            (self, to),
            (Uninitialised, Initialised)
                | (Initialised, Starting)
                | (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Stopping)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Initialised, Disposed)
                | (Stopped, Disposed)
                | (Uninitialised, Disposed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(EngineError::Lifecycle(format!(
                "cannot move from {self:?} to {to:?}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_is_allowed() {
        let mut state = LifecycleState::default();
        for next in [
            LifecycleState::Initialised,
            LifecycleState::Starting,
            LifecycleState::Started,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
            LifecycleState::Starting,
            LifecycleState::Started,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
            LifecycleState::Disposed,
        ] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, LifecycleState::Disposed);
    }

    #[test]
    fn cannot_start_twice() {
        let state = LifecycleState::Started;
        assert!(state.transition(LifecycleState::Starting).is_err());
    }

    #[test]
    fn disposal_is_terminal() {
        assert!(LifecycleState::Disposed.transition(LifecycleState::Initialised).is_err());
    }
}
