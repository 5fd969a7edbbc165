//! Control request (setup packet) definitions
//!
//! A control transfer starts with an 8-byte setup packet. Multi-byte fields
//! are little-endian on the wire regardless of host byte order.

use crate::error::{ProtocolError, Result};

/// Size of a USB setup packet in bytes
pub const SETUP_PACKET_LEN: usize = 8;

/// Data stage direction (bmRequestType bit 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// Request type (bmRequestType bits 6..5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient (bmRequestType bits 4..0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// A decoded control request header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

/// Set the headphone monitor (sidetone) volume to 100%
///
/// Class request, host to device, interface recipient. The high byte of
/// wIndex addresses unit 0x0B on interface 0.
pub const VOLUME_REQUEST: ControlRequest = ControlRequest {
    request_type: 0x21,
    request: 1,
    value: 0x0200,
    index: 0x0B00,
    length: 2,
};

/// Switch the sidetone path on
pub const STATE_REQUEST: ControlRequest = ControlRequest {
    request_type: 0x21,
    request: 1,
    value: 0x0100,
    index: 0x0B00,
    length: 1,
};

/// Data stage of [`VOLUME_REQUEST`]
pub const VOLUME_PAYLOAD: [u8; 2] = [0x00, 0xEA];

/// Data stage of [`STATE_REQUEST`]
pub const STATE_PAYLOAD: [u8; 1] = [0x00];

impl ControlRequest {
    /// Encode to the 8-byte wire representation
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();

        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Decode from the 8-byte wire representation
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SETUP_PACKET_LEN {
            return Err(ProtocolError::InvalidSetupLength {
                expected: SETUP_PACKET_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// Interface number addressed by wIndex (low byte)
    pub fn interface(&self) -> u8 {
        (self.index & 0xff) as u8
    }

    /// Check that a data stage buffer matches wLength
    pub fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.length as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                declared: self.length,
                actual: payload.len(),
            });
        }
        Ok(())
    }
}
