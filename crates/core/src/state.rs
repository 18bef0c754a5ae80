//! Session lifecycle states.

use std::fmt;
use thiserror::Error;
use tokio::sync::watch;

/// Where a session is in its lifecycle.
///
/// ```text
/// Init -> Connecting -> Active -> Closing -> Closed
///            |  ^         |         ^
///            |  '--(config error)   |
///            '------> Error --------'
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no upstream channel yet.
    Init,
    /// Translating config and opening the upstream channel.
    Connecting,
    /// Upstream channel open, both pumps running.
    Active,
    /// A fatal upstream fault is being reported.
    Error,
    /// Teardown started.
    Closing,
    /// All resources released.
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Init, Closing)
                | (Connecting, Init)
                | (Connecting, Active)
                | (Connecting, Error)
                | (Connecting, Closing)
                | (Active, Error)
                | (Active, Closing)
                | (Error, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Connecting => "CONNECTING",
            SessionState::Active => "ACTIVE",
            SessionState::Error => "ERROR",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Observable state holder. Transitions are checked against the lifecycle
/// graph; watchers see every accepted change.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Init);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        let mut outcome = Err(InvalidTransition {
            from: SessionState::Init,
            to,
        });
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(to) {
                outcome = Ok(*current);
                *current = to;
                true
            } else {
                outcome = Err(InvalidTransition { from: *current, to });
                false
            }
        });
        outcome
    }
}
