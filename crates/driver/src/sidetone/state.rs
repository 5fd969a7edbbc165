//! Per-device handshake state machine
//!
//! ```text
//! Idle -> VolumeSubmitted -> Terminated(VolumeFailed)
//!                         -> StateSubmitted -> Terminated(Success)
//!                                           -> Terminated(StateSubmitFailed)
//!                                           -> Terminated(StateFailed)
//! ```
//!
//! No edge goes backwards and there is no retry.

use std::fmt;
use thiserror::Error;

/// How a handshake ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Both commands were accepted; sidetone is on
    Success,
    /// Set-volume transfer failed
    VolumeFailed,
    /// Set-state command could not be queued
    StateSubmitFailed,
    /// Set-state transfer failed
    StateFailed,
}

/// Where a device's handshake currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandshakeState {
    /// Attach in progress, nothing submitted
    #[default]
    Idle,
    /// Set-volume command in flight
    VolumeSubmitted,
    /// Set-state command in flight (or being queued)
    StateSubmitted,
    /// Done; no further I/O for this device
    Terminated(Outcome),
}

/// A transition outside the handshake graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal handshake transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: HandshakeState,
    pub to: HandshakeState,
}

impl HandshakeState {
    /// True if `next` is an edge of the handshake graph from `self`
    pub fn can_advance(self, next: HandshakeState) -> bool {
        use HandshakeState::*;

        matches!(
            (self, next),
            (Idle, VolumeSubmitted)
                | (VolumeSubmitted, StateSubmitted)
                | (VolumeSubmitted, Terminated(Outcome::VolumeFailed))
                | (
                    StateSubmitted,
                    Terminated(Outcome::Success | Outcome::StateSubmitFailed | Outcome::StateFailed)
                )
        )
    }

    /// Move to `next`, refusing anything [`HandshakeState::can_advance`] rejects
    pub fn advance(&mut self, next: HandshakeState) -> Result<(), IllegalTransition> {
        if !self.can_advance(next) {
            return Err(IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Terminated(_))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            HandshakeState::Terminated(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Idle => write!(f, "idle"),
            HandshakeState::VolumeSubmitted => write!(f, "volume-submitted"),
            HandshakeState::StateSubmitted => write!(f, "state-submitted"),
            HandshakeState::Terminated(Outcome::Success) => write!(f, "terminated(success)"),
            HandshakeState::Terminated(Outcome::VolumeFailed) => {
                write!(f, "terminated(fail@volume)")
            }
            HandshakeState::Terminated(Outcome::StateSubmitFailed) => {
                write!(f, "terminated(fail@state-submit)")
            }
            HandshakeState::Terminated(Outcome::StateFailed) => {
                write!(f, "terminated(fail@state-complete)")
            }
        }
    }
}
