//! Device identification
//!
//! The driver binds to exactly one USB model. The match table is static and
//! read-only; the bus framework consults it when a device shows up.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Razer USB vendor ID
pub const RAZER_VID: u16 = 0x1532;
/// Razer USB Sound Card product ID
pub const RAZER_USB_SOUND_CARD_PID: u16 = 0x0529;

/// A vendor/product pair the driver binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMatch {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl DeviceMatch {
    /// Build a match entry for a USB vendor/product pair
    pub const fn usb(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check a device's IDs against this entry
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Find the table entry matching a device, if any
    pub fn lookup(table: &[DeviceMatch], vendor_id: u16, product_id: u16) -> Option<&DeviceMatch> {
        table.iter().find(|id| id.matches(vendor_id, product_id))
    }
}

impl fmt::Display for DeviceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Devices handled by the sidetone driver
pub const DEVICE_TABLE: &[DeviceMatch] = &[DeviceMatch::usb(RAZER_VID, RAZER_USB_SOUND_CARD_PID)];
