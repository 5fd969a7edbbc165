//! Control transfer completion status
//!
//! Status values follow Linux errno numbering so that log lines read the same
//! as the kernel's URB status reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a completed (or cancelled) control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer finished successfully
    Completed,
    /// Endpoint stalled (-EPIPE)
    Pipe,
    /// Lower layer timed out (-ETIMEDOUT)
    Timeout,
    /// Device went away (-ENODEV)
    NoDevice,
    /// Request was killed before it completed (-ENOENT)
    Cancelled,
    /// Device returned more data than requested (-EOVERFLOW)
    Overflow,
    /// Generic I/O failure (-EIO)
    Io,
    /// Any other negative errno
    Other(i32),
}

impl TransferStatus {
    /// Errno-style status code, 0 on success
    pub fn code(&self) -> i32 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Pipe => -32,
            TransferStatus::Timeout => -110,
            TransferStatus::NoDevice => -19,
            TransferStatus::Cancelled => -2,
            TransferStatus::Overflow => -75,
            TransferStatus::Io => -5,
            TransferStatus::Other(code) => *code,
        }
    }

    /// Map an errno-style code back to a status
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TransferStatus::Completed,
            -32 => TransferStatus::Pipe,
            -110 => TransferStatus::Timeout,
            -19 => TransferStatus::NoDevice,
            -2 => TransferStatus::Cancelled,
            -75 => TransferStatus::Overflow,
            -5 => TransferStatus::Io,
            other => TransferStatus::Other(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Pipe => write!(f, "pipe stalled ({})", self.code()),
            TransferStatus::Timeout => write!(f, "timed out ({})", self.code()),
            TransferStatus::NoDevice => write!(f, "no device ({})", self.code()),
            TransferStatus::Cancelled => write!(f, "cancelled ({})", self.code()),
            TransferStatus::Overflow => write!(f, "overflow ({})", self.code()),
            TransferStatus::Io => write!(f, "I/O error ({})", self.code()),
            TransferStatus::Other(code) => write!(f, "error {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TransferStatus::Completed.code(), 0);
        assert_eq!(TransferStatus::Pipe.code(), -32);
        assert_eq!(TransferStatus::Cancelled.code(), -2);
        assert_eq!(TransferStatus::Other(-71).code(), -71);
    }

    #[test]
    fn test_from_code() {
        for status in [
            TransferStatus::Completed,
            TransferStatus::Pipe,
            TransferStatus::Timeout,
            TransferStatus::NoDevice,
            TransferStatus::Cancelled,
            TransferStatus::Overflow,
            TransferStatus::Io,
            TransferStatus::Other(-71),
        ] {
            assert_eq!(TransferStatus::from_code(status.code()), status);
        }
    }

    #[test]
    fn test_only_completed_is_success() {
        assert!(TransferStatus::Completed.is_success());
        assert!(!TransferStatus::Cancelled.is_success());
        assert!(!TransferStatus::Pipe.is_success());
    }
}
