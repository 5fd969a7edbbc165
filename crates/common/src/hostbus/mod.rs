//! Host bus framework
//!
//! The framework owns device lifecycle and asynchronous I/O. Drivers plug in
//! through [`BusDriver`] and talk to hardware only through the pieces defined
//! here:
//!
//! - [`BusDevice`]: the device handle handed to attach/detach, carrying the
//!   per-device driver-data slot
//! - [`HostBus`]: generic device-description parse and communication channel
//!   start/stop, plus the memory [`Allocator`]
//! - [`Urb`]: a reusable asynchronous control request whose completion runs on
//!   its own execution context
//!
//! Backends implement [`HostBus`] and [`ControlPipe`]. The daemon uses libusb;
//! tests use [`crate::test_utils::MockBus`].

pub mod alloc;
pub mod device;
pub mod urb;

pub use alloc::{Allocation, Allocator, DmaBuf, SystemAllocator};
pub use device::{BusDevice, DeviceInfo, Transport};
pub use urb::{CompleteFn, Completion, ControlUrb, Urb};

use protocol::{ControlRequest, DeviceMatch, TransferStatus};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors reported by the host bus framework
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Out of memory")]
    NoMemory,

    #[error("Request already in flight")]
    Busy,

    #[error("Request is being cancelled")]
    Rejected,

    #[error("Device is gone")]
    NoDevice,

    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Device description parse failed ({0})")]
    Parse(i32),

    #[error("Communication channel start failed ({0})")]
    Start(i32),

    #[error("USB error: {0}")]
    Usb(String),
}

impl BusError {
    /// Negative errno equivalent
    pub fn errno(&self) -> i32 {
        match self {
            BusError::NoMemory => -12,
            BusError::Busy => -16,
            BusError::Rejected => -1,
            BusError::NoDevice => -19,
            BusError::InvalidRequest(_) => -22,
            BusError::Parse(code) | BusError::Start(code) => *code,
            BusError::Usb(_) => -5,
        }
    }
}

/// Endpoint 0 of a started device
///
/// Implementations perform one blocking OUT control transfer. They are called
/// from a request's completion context, never from the hotplug thread.
pub trait ControlPipe: Send + Sync {
    /// Send `data` as the data stage of `setup`, returning the bytes written
    fn control_out(&self, setup: &ControlRequest, data: &[u8]) -> Result<usize, TransferStatus>;

    /// Check a transfer may be queued on this pipe
    ///
    /// Called by [`Urb::submit`] before it queues; an error is returned from
    /// the submission and nothing is queued.
    fn accept(&self, _setup: &ControlRequest) -> Result<(), BusError> {
        Ok(())
    }
}

/// The bus-level services a driver may use during attach/detach
pub trait HostBus: Send + Sync {
    /// Parse the device's descriptors
    fn parse(&self, device: &BusDevice) -> Result<(), BusError>;

    /// Start the communication channel and hand out its control pipe
    fn hw_start(&self, device: &BusDevice) -> Result<Arc<dyn ControlPipe>, BusError>;

    /// Stop the communication channel started by [`HostBus::hw_start`]
    fn hw_stop(&self, device: &BusDevice);

    /// Allocator for driver memory
    fn allocator(&self) -> Arc<dyn Allocator>;
}

/// A driver registered with the bus
pub trait BusDriver: Send + Sync {
    /// Driver name used in logs
    fn name(&self) -> &'static str;

    /// Devices this driver binds to
    fn id_table(&self) -> &'static [DeviceMatch];

    /// Attach entry point: 0 on success, negative errno on failure
    ///
    /// On a non-zero return the bus never calls [`BusDriver::remove`] for
    /// this device.
    fn probe(&self, device: &BusDevice, id: &DeviceMatch) -> i32;

    /// Detach entry point; must not fail
    fn remove(&self, device: &BusDevice);
}

/// Match a device against a driver's table and probe it
///
/// Returns `None` if the driver does not handle the device, otherwise the
/// probe status.
pub fn bind(driver: &dyn BusDriver, device: &BusDevice) -> Option<i32> {
    let info = device.info();
    let id = DeviceMatch::lookup(driver.id_table(), info.vendor_id, info.product_id)?;

    debug!(
        "{}: probing {} at bus={}, addr={}",
        driver.name(),
        id,
        info.bus_number,
        info.address
    );

    Some(driver.probe(device, id))
}
