//! USB device abstraction
//!
//! Wraps a rusb::Device with its cached descriptor and, once the channel is
//! started, the open handle.

use super::transfers::errno_for;
use common::hostbus::{BusError, DeviceInfo};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// USB device wrapper with cached information
pub struct UsbDevice {
    /// Underlying rusb device
    device: Device<Context>,
    /// Cached device descriptor
    descriptor: DeviceDescriptor,
    /// Open handle, shared with the control pipe
    handle: Option<Arc<Mutex<DeviceHandle<Context>>>>,
}

impl UsbDevice {
    /// Create a new USB device wrapper
    ///
    /// Reads and caches the device descriptor.
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;

        Ok(Self {
            device,
            descriptor,
            handle: None,
        })
    }

    /// (bus, address) key
    pub fn key(&self) -> (u8, u8) {
        (self.device.bus_number(), self.device.address())
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Identity for the bus, including string descriptors if readable
    pub fn device_info(&self) -> DeviceInfo {
        let (product, serial_number) = match self.device.open() {
            Ok(handle) => (
                self.descriptor
                    .product_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                self.descriptor
                    .serial_number_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
            ),
            Err(e) => {
                debug!("Cannot open {:?} for string descriptors: {}", self.key(), e);
                (None, None)
            }
        };

        DeviceInfo {
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bus_number: self.device.bus_number(),
            address: self.device.address(),
            product,
            serial_number,
        }
    }

    /// Check the active configuration exposes `interface`
    pub fn parse(&self, interface: u8) -> Result<(), BusError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| BusError::Parse(errno_for(e)))?;

        if !config.interfaces().any(|i| i.number() == interface) {
            warn!(
                "Device {:?} has no interface {} in configuration {}",
                self.key(),
                interface,
                config.number()
            );
            return Err(BusError::Parse(-22));
        }

        debug!(
            "Parsed {:?}: {} interfaces in configuration {}",
            self.key(),
            config.num_interfaces(),
            config.number()
        );
        Ok(())
    }

    /// Open the device, or hand out the handle already open
    ///
    /// Interfaces are not claimed here; the control pipe claims around each
    /// transfer so a bound kernel driver is only detached for that long.
    pub fn open(&mut self) -> Result<Arc<Mutex<DeviceHandle<Context>>>, BusError> {
        if let Some(handle) = &self.handle {
            return Ok(Arc::clone(handle));
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {:?}: {}", self.key(), e);
            BusError::Start(errno_for(e))
        })?;

        let handle = Arc::new(Mutex::new(handle));
        self.handle = Some(Arc::clone(&handle));
        debug!("Opened device {:?}", self.key());
        Ok(handle)
    }

    /// Close the device
    ///
    /// libusb closes the handle once the control pipe lets go of it too.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if Arc::strong_count(&handle) > 1 {
            debug!("Handle for {:?} still held by its control pipe", self.key());
        }
        debug!("Closed device {:?}", self.key());
    }

    /// Check if device is open
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}
