//! Bus device handle
//!
//! A `BusDevice` is a cheap, clonable handle to a device known to the bus. It
//! carries the device's identity and the opaque per-device driver-data slot.
//! The slot is the only place a driver keeps its per-device context.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Transport a device is reachable through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// USB, with a control channel on endpoint 0
    Usb,
    /// Bluetooth (no USB control channel)
    Bluetooth,
    /// Software device (uhid and similar)
    Virtual,
}

/// Identity of a device on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub address: u8,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
}

type DriverData = Arc<dyn Any + Send + Sync>;

struct DeviceInner {
    info: DeviceInfo,
    transport: Transport,
    drvdata: Mutex<Option<DriverData>>,
}

/// Handle to a device on the bus
#[derive(Clone)]
pub struct BusDevice {
    inner: Arc<DeviceInner>,
}

impl BusDevice {
    pub fn new(info: DeviceInfo, transport: Transport) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                info,
                transport,
                drvdata: Mutex::new(None),
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    /// True if the device has a USB control channel
    pub fn is_usb(&self) -> bool {
        self.inner.transport == Transport::Usb
    }

    /// (bus, address) key
    pub fn key(&self) -> (u8, u8) {
        (self.inner.info.bus_number, self.inner.info.address)
    }

    /// True if both handles refer to the same device instance
    pub fn same_device(&self, other: &BusDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Store the driver's per-device context
    pub fn set_drvdata<T: Any + Send + Sync>(&self, data: Arc<T>) {
        *self.slot() = Some(data as DriverData);
    }

    /// Fetch the driver's per-device context
    ///
    /// Returns `None` if the slot is empty or holds a different type.
    pub fn drvdata<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.slot().clone()?;
        data.downcast::<T>().ok()
    }

    /// Empty the slot, returning what it held
    pub fn take_drvdata<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.slot().take()?;
        data.downcast::<T>().ok()
    }

    pub fn has_drvdata(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<DriverData>> {
        self.inner
            .drvdata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for BusDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusDevice")
            .field("vid", &format_args!("{:#06x}", self.inner.info.vendor_id))
            .field("pid", &format_args!("{:#06x}", self.inner.info.product_id))
            .field("bus", &self.inner.info.bus_number)
            .field("addr", &self.inner.info.address)
            .field("transport", &self.inner.transport)
            .finish()
    }
}

impl fmt::Display for BusDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} device {:03})",
            self.inner.info.vendor_id,
            self.inner.info.product_id,
            self.inner.info.bus_number,
            self.inner.info.address
        )
    }
}
