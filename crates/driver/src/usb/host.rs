//! libusb implementation of the host bus
//!
//! The manager registers every device it is about to probe; `parse` and
//! `hw_start` then work on that registration. Interface numbers come from the
//! driver's request template, whose index low byte addresses the audio
//! control interface.

use super::device::UsbDevice;
use super::transfers::RusbPipe;
use crate::config::UsbSettings;
use common::hostbus::{Allocator, BusDevice, BusError, ControlPipe, HostBus, SystemAllocator};
use protocol::VOLUME_REQUEST;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Host bus backed by rusb
pub struct UsbHost {
    devices: Mutex<HashMap<(u8, u8), UsbDevice>>,
    allocator: Arc<SystemAllocator>,
    settings: UsbSettings,
}

impl UsbHost {
    pub fn new(settings: UsbSettings) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            allocator: Arc::new(SystemAllocator::new()),
            settings,
        }
    }

    /// Make `device` available to `parse`/`hw_start`
    pub fn register(&self, device: UsbDevice) {
        let key = device.key();
        debug!("Registered device {:?}", key);
        self.devices().insert(key, device);
    }

    /// Forget a device, closing it if still open
    pub fn unregister(&self, key: (u8, u8)) -> bool {
        self.devices().remove(&key).is_some()
    }

    pub fn is_registered(&self, key: (u8, u8)) -> bool {
        self.devices().contains_key(&key)
    }

    /// Driver memory currently reserved
    pub fn live_bytes(&self) -> usize {
        self.allocator.live_bytes()
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<(u8, u8), UsbDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostBus for UsbHost {
    fn parse(&self, device: &BusDevice) -> Result<(), BusError> {
        let devices = self.devices();
        let usb = devices.get(&device.key()).ok_or(BusError::NoDevice)?;
        usb.parse(VOLUME_REQUEST.interface())
    }

    fn hw_start(&self, device: &BusDevice) -> Result<Arc<dyn ControlPipe>, BusError> {
        let mut devices = self.devices();
        let usb = devices.get_mut(&device.key()).ok_or(BusError::NoDevice)?;
        let handle = usb.open()?;

        let pipe: Arc<dyn ControlPipe> = Arc::new(RusbPipe::new(
            handle,
            VOLUME_REQUEST.interface(),
            self.settings.claim_interface,
            self.settings.transfer_timeout(),
        ));
        Ok(pipe)
    }

    fn hw_stop(&self, device: &BusDevice) {
        if let Some(usb) = self.devices().get_mut(&device.key()) {
            usb.close();
        }
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }
}
