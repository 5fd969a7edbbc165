//! Driver error taxonomy

use common::hostbus::BusError;
use protocol::TransferStatus;
use std::fmt;
use thiserror::Error;

const EINVAL: i32 = -22;
const ENOMEM: i32 = -12;
const ENODEV: i32 = -19;

/// Which half of the sidetone handshake an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Set-volume command
    Volume,
    /// Set-state (enable) command
    State,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Volume => write!(f, "set-volume"),
            Stage::State => write!(f, "set-state"),
        }
    }
}

/// Errors raised by the sidetone driver
///
/// Everything but `Transfer` is an attach-time failure and is returned to the
/// bus as a negative status. `Transfer` only happens in a completion handler
/// and is logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("Device has no USB control channel")]
    InvalidDevice,

    #[error("Descriptor parse failed: {0}")]
    Parse(BusError),

    #[error("Hardware start failed: {0}")]
    HardwareStart(BusError),

    #[error("Out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("Failed to submit {stage} command: {error}")]
    Submission { stage: Stage, error: BusError },

    #[error("{stage} command failed: {status}")]
    Transfer { stage: Stage, status: TransferStatus },
}

impl DriverError {
    /// Negative errno reported to the bus
    pub fn errno(&self) -> i32 {
        match self {
            DriverError::InvalidDevice => EINVAL,
            DriverError::Parse(err) => negative_or(err.errno(), EINVAL),
            DriverError::HardwareStart(err) => negative_or(err.errno(), ENODEV),
            DriverError::OutOfMemory(_) => ENOMEM,
            DriverError::Submission { error, .. } => error.errno(),
            DriverError::Transfer { status, .. } => negative_or(status.code(), EINVAL),
        }
    }

    /// Stage of the handshake, for post-attach errors
    pub fn stage(&self) -> Option<Stage> {
        match self {
            DriverError::Submission { stage, .. } | DriverError::Transfer { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }
}

fn negative_or(code: i32, default: i32) -> i32 {
    if code < 0 { code } else { default }
}
