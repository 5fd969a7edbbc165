//! USB device manager
//!
//! Binds the sidetone driver to matching devices as they appear and unbinds
//! it as they go. Runs on the USB thread; the libusb hotplug callback only
//! forwards arrivals and departures to it over a channel.

use crate::config::UsbSettings;
use crate::sidetone::SidetoneDriver;
use crate::usb::device::UsbDevice;
use crate::usb::host::UsbHost;
use common::UsbEvent;
use common::hostbus::{BusDevice, BusDriver, DeviceInfo, Transport, bind};
use protocol::DeviceMatch;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Arrival or departure reported by libusb
#[derive(Debug)]
pub enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

/// USB device manager
pub struct DeviceManager {
    /// USB context for device operations
    context: Context,
    /// Host bus the driver runs on
    host: Arc<UsbHost>,
    /// The sidetone driver
    driver: SidetoneDriver,
    /// Devices the driver is attached to, keyed by (bus, address)
    bound: HashMap<(u8, u8), BusDevice>,
    /// Matching devices whose attach failed; not retried until they go away
    refused: HashSet<(u8, u8)>,
    /// Hot-plug registrations, one per match table entry
    hotplug_registrations: Vec<Registration<Context>>,
    hotplug_tx: async_channel::Sender<HotplugEvent>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
    /// Event sender for lifecycle notifications
    event_sender: async_channel::Sender<UsbEvent>,
}

impl DeviceManager {
    /// Create a new device manager
    pub fn new(
        event_sender: async_channel::Sender<UsbEvent>,
        settings: UsbSettings,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let host = Arc::new(UsbHost::new(settings));
        let driver = SidetoneDriver::new(host.clone());
        let (hotplug_tx, hotplug_rx) = async_channel::unbounded();

        Ok(Self {
            context,
            host,
            driver,
            bound: HashMap::new(),
            refused: HashSet::new(),
            hotplug_registrations: Vec::new(),
            hotplug_tx,
            hotplug_rx,
            event_sender,
        })
    }

    /// Bind to devices already plugged in and watch for new ones
    ///
    /// This should be called once after creating the manager.
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        if rusb::has_hotplug() {
            self.register_hotplug()?;
        } else {
            warn!("libusb has no hotplug support, polling for devices");
        }

        self.rescan()?;

        info!(
            "Device manager initialized, {} device(s) bound",
            self.bound.len()
        );
        Ok(())
    }

    /// Register hot-plug callbacks
    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        for id in self.driver.id_table() {
            let callback = HotplugCallback {
                sender: self.hotplug_tx.clone(),
            };

            let registration = HotplugBuilder::new()
                .vendor_id(id.vendor_id)
                .product_id(id.product_id)
                .enumerate(false) // rescan() covers devices already present
                .register(&self.context, Box::new(callback))?;

            self.hotplug_registrations.push(registration);
            debug!("Hot-plug callback registered for {}", id);
        }
        Ok(())
    }

    /// Reconcile bindings with the devices currently on the bus
    pub fn rescan(&mut self) -> Result<(), rusb::Error> {
        let mut present = HashSet::new();

        for device in self.context.devices()?.iter() {
            let key = (device.bus_number(), device.address());
            if self.matching(&device).is_some() {
                present.insert(key);
                if !self.bound.contains_key(&key) && !self.refused.contains(&key) {
                    self.handle_device_arrived(device);
                }
            }
        }

        let gone: Vec<(u8, u8)> = self
            .bound
            .keys()
            .chain(self.refused.iter())
            .filter(|key| !present.contains(*key))
            .copied()
            .collect();
        for (bus, address) in gone {
            self.handle_device_left(bus, address);
        }

        Ok(())
    }

    /// Drain events forwarded by the hotplug callback
    pub fn process_hotplug_events(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => self.handle_device_arrived(device),
                HotplugEvent::Left { bus, address } => self.handle_device_left(bus, address),
            }
        }
    }

    /// True if device changes must be found by polling
    pub fn needs_polling(&self) -> bool {
        self.hotplug_registrations.is_empty()
    }

    /// Probe a newly arrived device
    pub fn handle_device_arrived(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());
        if self.bound.contains_key(&key) {
            debug!("Device {:?} already bound", key);
            return;
        }

        let usb_device = match UsbDevice::new(device) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to read descriptor of {:?}: {}", key, e);
                return;
            }
        };

        let info = usb_device.device_info();
        let bus_device = BusDevice::new(info.clone(), Transport::Usb);
        self.host.register(usb_device);

        match bind(&self.driver, &bus_device) {
            Some(0) => {
                info!("Bound {} to {}", self.driver.name(), bus_device);
                self.refused.remove(&key);
                self.bound.insert(key, bus_device);
                self.send(UsbEvent::DeviceAttached { device: info });
            }
            Some(status) => {
                self.host.unregister(key);
                self.refused.insert(key);
                self.send(UsbEvent::AttachFailed {
                    device: info,
                    status,
                });
            }
            None => {
                self.host.unregister(key);
            }
        }
    }

    /// Unbind a device that went away
    pub fn handle_device_left(&mut self, bus: u8, address: u8) {
        let key = (bus, address);
        self.refused.remove(&key);

        if let Some(device) = self.bound.remove(&key) {
            self.unbind(device);
        }
    }

    /// Detach every bound device
    pub fn detach_all(&mut self) {
        let devices: Vec<BusDevice> = self.bound.drain().map(|(_, device)| device).collect();
        for device in devices {
            self.unbind(device);
        }
    }

    fn unbind(&mut self, device: BusDevice) {
        self.driver.remove(&device);
        self.host.unregister(device.key());
        info!("Unbound {} from {}", self.driver.name(), device);
        self.send(UsbEvent::DeviceDetached {
            device: device.info().clone(),
        });
    }

    /// Matching devices currently connected
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .iter()
            .filter(|device| self.matching(device).is_some())
            .filter_map(|device| UsbDevice::new(device).ok())
            .map(|device| device.device_info())
            .collect()
    }

    /// Devices the driver is attached to
    pub fn bound_devices(&self) -> Vec<DeviceInfo> {
        self.bound
            .values()
            .map(|device| device.info().clone())
            .collect()
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn matching(&self, device: &Device<Context>) -> Option<&'static DeviceMatch> {
        let desc = device.device_descriptor().ok()?;
        DeviceMatch::lookup(self.driver.id_table(), desc.vendor_id(), desc.product_id())
    }

    fn send(&self, event: UsbEvent) {
        if let Err(e) = self.event_sender.try_send(event) {
            debug!("Dropped lifecycle event: {}", e);
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if !self.bound.is_empty() {
            error!(
                "Device manager dropped with {} device(s) still bound, detaching",
                self.bound.len()
            );
            self.detach_all();
        }
    }
}

/// Hot-plug callback handler
///
/// Forwards events to the manager, which handles them on the USB thread.
struct HotplugCallback {
    sender: async_channel::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if self.sender.try_send(HotplugEvent::Arrived(device)).is_err() {
            warn!("Hot-plug arrival dropped, manager is gone");
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let event = HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        };
        if self.sender.try_send(event).is_err() {
            warn!("Hot-plug departure dropped, manager is gone");
        }
    }
}
