//! Common utilities for rzrst
//!
//! This crate provides the host bus framework the sidetone driver is written
//! against, the async channel bridge between the Tokio runtime and the USB
//! thread, logging setup, and shared error handling.

pub mod channel;
pub mod error;
pub mod hostbus;
pub mod logging;
pub mod test_utils;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
