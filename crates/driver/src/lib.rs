//! rzrst: sidetone enabler for the Razer USB Sound Card
//!
//! - [`sidetone`]: the driver itself, written against the host bus traits in
//!   `common::hostbus` so it runs unchanged on libusb or the mock bus
//! - [`usb`]: the libusb host bus, hotplug handling and worker thread
//! - [`config`]: TOML configuration
//! - [`service`]: systemd notifications

pub mod config;
pub mod service;
pub mod sidetone;
pub mod usb;

pub use sidetone::{DriverError, HandshakeState, Outcome, SidetoneDriver, Stage};
