//! Call-level signaling state machine

use crate::{Error, Result};
use serde::Serialize;

/// Negotiation lifecycle of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingState {
    Idle,
    Connecting,
    Offering,
    Answering,
    Stable,
    Closed,
    Failed,
}

impl SignalingState {
    /// Closed and failed calls accept no further negotiation
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalingState::Closed | SignalingState::Failed)
    }

    /// A call exists and has not ended
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != SignalingState::Idle
    }
}

/// Inputs that drive [`SignalingStateMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingTrigger {
    /// startCall / joinCall
    Start,
    /// Local offer requested
    LocalOffer,
    /// Remote offer received for the active call
    RemoteOffer,
    /// Some peer's native connection reported connected
    PeerConnected,
    /// A remote answer was applied
    RemoteAnswerApplied,
    /// Unrecoverable connection failure
    Failure,
    /// endCall, local leave, or remote termination
    End,
}

/// An applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: SignalingState,
    pub to: SignalingState,
}

/// Holds the one state of a call and validates transitions
///
/// ```text
/// idle -> connecting -> offering|answering -> stable -> closed
///           \______________ any non-terminal ______________/-> failed
/// ```
///
/// Transitions into the current state are no-ops and report no change.
#[derive(Debug, Clone)]
pub struct SignalingStateMachine {
    state: SignalingState,
}

impl Default for SignalingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingStateMachine {
    pub fn new() -> Self {
        Self {
            state: SignalingState::Idle,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Apply a trigger
    ///
    /// Returns `Ok(Some(change))` when the state moved, `Ok(None)` when the
    /// trigger leaves it where it is, and [`Error::InvalidState`] when the
    /// trigger makes no sense from the current state.
    pub fn apply(&mut self, trigger: SignalingTrigger) -> Result<Option<StateChange>> {
        use SignalingState::*;
        use SignalingTrigger::*;

        let next = match (trigger, self.state) {
            (Start, Idle | Closed | Failed) => Connecting,
            (Start, Connecting) => Connecting,

            (LocalOffer, Connecting) => Offering,
            (RemoteOffer, Connecting) => Answering,
            // other peers keep negotiating once the call is past connecting
            (LocalOffer | RemoteOffer, Offering | Answering | Stable) => self.state,

            (PeerConnected | RemoteAnswerApplied, Offering | Answering) => Stable,
            (PeerConnected | RemoteAnswerApplied, Stable) => Stable,

            (Failure, Closed) => Closed,
            (Failure, _) => Failed,

            (End, _) => Closed,

            (trigger, state) => {
                return Err(Error::InvalidState(format!(
                    "{:?} not allowed in state {:?}",
                    trigger, state
                )))
            }
        };

        if next == self.state {
            return Ok(None);
        }

        let change = StateChange {
            from: self.state,
            to: next,
        };
        self.state = next;
        Ok(Some(change))
    }
}
