//! USB subsystem
//!
//! The libusb side of the daemon:
//! - [`UsbHost`]: the host bus the sidetone driver runs on
//! - [`DeviceManager`]: hotplug handling and driver binding
//! - [`UsbWorkerThread`]: the dedicated thread owning the libusb context
//!
//! The worker runs on its own OS thread so libusb never blocks the Tokio
//! runtime; the two talk through the channel bridge in `common`.

pub mod device;
pub mod host;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use device::UsbDevice;
pub use host::UsbHost;
pub use manager::{DeviceManager, HotplugEvent};
pub use transfers::{ClaimPlan, RusbPipe, map_rusb_error};
pub use worker::{UsbWorkerThread, spawn_usb_worker};
