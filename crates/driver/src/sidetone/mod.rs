//! Sidetone driver for the Razer USB Sound Card
//!
//! On attach the driver queues a two-step handshake on the card's control
//! endpoint: set the sidetone volume, then switch sidetone on. Attach returns
//! as soon as the first command is queued; the second is queued from the
//! first one's completion handler.
//!
//! Everything the driver needs per device lives in a [`SoundCard`] stored in
//! the device's driver-data slot. It is built in full before anything is
//! submitted and torn down only after the request has been cancelled.

mod context;
mod error;
mod handshake;
mod state;

pub use context::{
    ACQUISITION_ORDER, CONTEXT_LABEL, STATE_DESCRIPTOR_LABEL, STATE_PAYLOAD_LABEL, SoundCard,
    URB_LABEL, VOLUME_DESCRIPTOR_LABEL, VOLUME_PAYLOAD_LABEL,
};
pub use error::{DriverError, Stage};
pub use state::{HandshakeState, IllegalTransition, Outcome};

use common::hostbus::{Allocation, BusDevice, BusDriver, BusError, DmaBuf, HostBus, Urb};
use context::Resources;
use handshake::handshake_complete;
use protocol::{
    DEVICE_TABLE, DeviceMatch, STATE_PAYLOAD, STATE_REQUEST, VOLUME_PAYLOAD, VOLUME_REQUEST,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Driver name reported to the bus
pub const DRIVER_NAME: &str = "rzrst";

/// Stops a started channel on drop unless disarmed
struct StartedChannel<'a> {
    bus: &'a dyn HostBus,
    device: &'a BusDevice,
    armed: bool,
}

impl<'a> StartedChannel<'a> {
    fn new(bus: &'a dyn HostBus, device: &'a BusDevice) -> Self {
        Self {
            bus,
            device,
            armed: true,
        }
    }

    /// Keep the channel running past this scope
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartedChannel<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("{}: stopping channel after failed attach", self.device);
            self.bus.hw_stop(self.device);
        }
    }
}

/// The sidetone driver, bound to one host bus
pub struct SidetoneDriver {
    bus: Arc<dyn HostBus>,
}

impl SidetoneDriver {
    pub fn new(bus: Arc<dyn HostBus>) -> Self {
        Self { bus }
    }

    /// Attach to `device` and queue the set-volume command
    ///
    /// On error every resource acquired so far has been released and the
    /// channel is stopped again.
    pub fn attach(&self, device: &BusDevice) -> Result<(), DriverError> {
        if !device.is_usb() {
            return Err(DriverError::InvalidDevice);
        }

        self.bus.parse(device).map_err(DriverError::Parse)?;
        let started = self
            .bus
            .hw_start(device)
            .map_err(DriverError::HardwareStart)?;
        let channel = StartedChannel::new(self.bus.as_ref(), device);
        // Bound after the guard so an early return drops it before the stop
        let pipe = started;

        let resources = self.acquire()?;
        let card = Arc::new(SoundCard::new(pipe, resources));
        device.set_drvdata(Arc::clone(&card));

        if let Err(err) = card.advance(HandshakeState::VolumeSubmitted) {
            warn!("{}: {}", device, err);
        }

        if let Err(error) = card
            .urb()
            .submit(card.volume_transfer(handshake_complete, device))
        {
            device.take_drvdata::<SoundCard>();
            return Err(DriverError::Submission {
                stage: Stage::Volume,
                error,
            });
        }

        channel.disarm();
        info!("{}: attached, sidetone handshake queued", device);
        Ok(())
    }

    /// Acquire the context's resources in order
    ///
    /// A failure drops whatever was acquired before it, newest first.
    fn acquire(&self) -> Result<Resources, DriverError> {
        let allocator = self.bus.allocator();

        let allocation = Allocation::new(
            &allocator,
            CONTEXT_LABEL,
            std::mem::size_of::<SoundCard>(),
        )
        .map_err(out_of_memory(CONTEXT_LABEL))?;
        let urb = Urb::alloc(&allocator, URB_LABEL).map_err(out_of_memory(URB_LABEL))?;
        let volume_descriptor =
            DmaBuf::copy_from(&allocator, VOLUME_DESCRIPTOR_LABEL, &VOLUME_REQUEST.to_bytes())
                .map_err(out_of_memory(VOLUME_DESCRIPTOR_LABEL))?;
        let state_descriptor =
            DmaBuf::copy_from(&allocator, STATE_DESCRIPTOR_LABEL, &STATE_REQUEST.to_bytes())
                .map_err(out_of_memory(STATE_DESCRIPTOR_LABEL))?;
        let volume_payload = DmaBuf::copy_from(&allocator, VOLUME_PAYLOAD_LABEL, &VOLUME_PAYLOAD)
            .map_err(out_of_memory(VOLUME_PAYLOAD_LABEL))?;
        let state_payload = DmaBuf::copy_from(&allocator, STATE_PAYLOAD_LABEL, &STATE_PAYLOAD)
            .map_err(out_of_memory(STATE_PAYLOAD_LABEL))?;

        Ok(Resources {
            state_payload,
            volume_payload,
            state_descriptor,
            volume_descriptor,
            urb,
            allocation,
        })
    }

    /// Cancel outstanding I/O, free the context and stop the channel
    pub fn detach(&self, device: &BusDevice) {
        let Some(card) = device.drvdata::<SoundCard>() else {
            warn!("{}: detach without driver context", device);
            return;
        };

        card.urb().kill();

        drop(device.take_drvdata::<SoundCard>());
        if let Err(card) = Arc::try_unwrap(card) {
            error!(
                "{}: context still has {} other owners after cancel",
                device,
                Arc::strong_count(&card) - 1
            );
        }

        self.bus.hw_stop(device);
        info!("{}: detached", device);
    }

    /// Handshake state of an attached device
    pub fn handshake_state(&self, device: &BusDevice) -> Option<HandshakeState> {
        device.drvdata::<SoundCard>().map(|card| card.state())
    }
}

fn out_of_memory(label: &'static str) -> impl FnOnce(BusError) -> DriverError {
    move |_| DriverError::OutOfMemory(label)
}

impl BusDriver for SidetoneDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn id_table(&self) -> &'static [DeviceMatch] {
        DEVICE_TABLE
    }

    fn probe(&self, device: &BusDevice, id: &DeviceMatch) -> i32 {
        debug!("{}: probe {} as {}", DRIVER_NAME, device, id);

        match self.attach(device) {
            Ok(()) => 0,
            Err(err) => {
                error!("{}: attach failed: {} ({})", device, err, err.errno());
                err.errno()
            }
        }
    }

    fn remove(&self, device: &BusDevice) {
        self.detach(device);
    }
}
