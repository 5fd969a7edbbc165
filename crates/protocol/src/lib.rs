//! Wire format for the Razer USB sound card sidetone handshake
//!
//! This crate defines everything that goes over the device's control channel:
//! the 8-byte setup packet codec, the two vendor command templates with their
//! payloads, the device match table, and the completion status codes reported
//! for a control transfer.
//!
//! # Example
//!
//! ```
//! use protocol::{VOLUME_REQUEST, VOLUME_PAYLOAD, ControlRequest};
//!
//! let setup = VOLUME_REQUEST.to_bytes();
//! assert_eq!(setup, [0x21, 0x01, 0x00, 0x02, 0x00, 0x0B, 0x02, 0x00]);
//!
//! let decoded = ControlRequest::from_bytes(&setup).unwrap();
//! assert_eq!(decoded, VOLUME_REQUEST);
//! assert_eq!(decoded.length as usize, VOLUME_PAYLOAD.len());
//! ```

pub mod error;
pub mod ids;
pub mod request;
pub mod status;

pub use error::{ProtocolError, Result};
pub use ids::{DEVICE_TABLE, DeviceMatch, RAZER_USB_SOUND_CARD_PID, RAZER_VID};
pub use request::{
    ControlRequest, Direction, Recipient, RequestKind, SETUP_PACKET_LEN, STATE_PAYLOAD,
    STATE_REQUEST, VOLUME_PAYLOAD, VOLUME_REQUEST,
};
pub use status::TransferStatus;
