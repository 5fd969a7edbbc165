//! USB control transfer execution
//!
//! Control OUT transfers go through libusb's synchronous API and run on the
//! request's completion thread. The audio control interface is claimed for
//! the length of each transfer, with snd-usb-audio detached meanwhile if it
//! is bound. rusb errors are mapped to errno-style statuses so they read the
//! same as the kernel's.

use common::hostbus::ControlPipe;
use protocol::{ControlRequest, Direction, TransferStatus};
use rusb::{Context, DeviceHandle};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for USB transfers (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the pipe gets hold of an interface before a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPlan {
    /// Send without claiming
    Skip,
    /// Claim the free interface
    Claim,
    /// Detach the bound kernel driver, claim, and reattach it afterwards
    DetachAndClaim,
}

impl ClaimPlan {
    /// Decide from the claim setting and libusb's kernel driver query
    ///
    /// usbfs refuses class requests to an interface some other driver owns,
    /// so a bound kernel driver has to be detached for the transfer.
    pub fn decide(claim: bool, kernel_driver_active: Result<bool, rusb::Error>) -> Self {
        match (claim, kernel_driver_active) {
            (false, _) => ClaimPlan::Skip,
            (true, Ok(true)) => ClaimPlan::DetachAndClaim,
            // NotSupported off Linux: there is no kernel driver to move
            (true, _) => ClaimPlan::Claim,
        }
    }
}

/// Endpoint 0 of an open rusb device
pub struct RusbPipe {
    handle: Arc<Mutex<DeviceHandle<Context>>>,
    interface: u8,
    claim: bool,
    timeout: Duration,
}

impl RusbPipe {
    pub fn new(
        handle: Arc<Mutex<DeviceHandle<Context>>>,
        interface: u8,
        claim: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            handle,
            interface,
            claim,
            timeout,
        }
    }

    fn write(
        &self,
        handle: &DeviceHandle<Context>,
        setup: &ControlRequest,
        data: &[u8],
    ) -> Result<usize, rusb::Error> {
        handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            self.timeout,
        )
    }

    /// Run one transfer with the interface claimed, then hand it back
    fn write_claimed(
        &self,
        handle: &mut DeviceHandle<Context>,
        setup: &ControlRequest,
        data: &[u8],
    ) -> Result<usize, rusb::Error> {
        let interface = self.interface;
        let plan = ClaimPlan::decide(self.claim, handle.kernel_driver_active(interface));

        if plan == ClaimPlan::Skip {
            return self.write(handle, setup, data);
        }

        let detached = plan == ClaimPlan::DetachAndClaim;
        if detached {
            handle.detach_kernel_driver(interface)?;
            debug!("Detached kernel driver from interface {}", interface);
        }

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            if detached && let Err(e) = handle.attach_kernel_driver(interface) {
                warn!("Failed to reattach kernel driver to interface {}: {}", interface, e);
            }
            return Err(e);
        }

        let result = self.write(handle, setup, data);

        if let Err(e) = handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if detached {
            match handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => warn!(
                    "Failed to reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }

        result
    }
}

impl ControlPipe for RusbPipe {
    fn control_out(&self, setup: &ControlRequest, data: &[u8]) -> Result<usize, TransferStatus> {
        if setup.direction() != Direction::Out {
            warn!("Refusing IN request {:#x} on an OUT pipe", setup.request_type);
            return Err(TransferStatus::Other(-22));
        }

        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data.len()
        );

        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        match self.write_claimed(&mut handle, setup, data) {
            Ok(len) => {
                debug!("Control transfer succeeded: {} bytes", len);
                Ok(len)
            }
            Err(e) => {
                warn!("Control transfer failed: {}", e);
                Err(map_rusb_error(e))
            }
        }
    }
}

/// Negative errno for a rusb error
pub fn errno_for(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -5,
        rusb::Error::InvalidParam => -22,
        rusb::Error::Access => -13,
        rusb::Error::NoDevice => -19,
        rusb::Error::NotFound => -2,
        rusb::Error::Busy => -16,
        rusb::Error::Timeout => -110,
        rusb::Error::Overflow => -75,
        rusb::Error::Pipe => -32,
        rusb::Error::Interrupted => -4,
        rusb::Error::NoMem => -12,
        rusb::Error::NotSupported => -95,
        _ => -5,
    }
}

/// Map rusb::Error to a transfer status
pub fn map_rusb_error(err: rusb::Error) -> TransferStatus {
    TransferStatus::from_code(errno_for(err))
}
