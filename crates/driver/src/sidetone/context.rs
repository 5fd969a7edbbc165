//! Per-device driver context

use super::state::{HandshakeState, IllegalTransition};
use common::hostbus::{Allocation, BusDevice, CompleteFn, ControlPipe, ControlUrb, DmaBuf, Urb};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Allocation label of the context itself
pub const CONTEXT_LABEL: &str = "sound_card";
/// Allocation label of the request object
pub const URB_LABEL: &str = "urb";
/// Allocation label of the set-volume setup packet
pub const VOLUME_DESCRIPTOR_LABEL: &str = "volume_descriptor";
/// Allocation label of the set-state setup packet
pub const STATE_DESCRIPTOR_LABEL: &str = "state_descriptor";
/// Allocation label of the set-volume data stage
pub const VOLUME_PAYLOAD_LABEL: &str = "volume_payload";
/// Allocation label of the set-state data stage
pub const STATE_PAYLOAD_LABEL: &str = "state_payload";

/// Order in which attach acquires its resources
pub const ACQUISITION_ORDER: [&str; 6] = [
    CONTEXT_LABEL,
    URB_LABEL,
    VOLUME_DESCRIPTOR_LABEL,
    STATE_DESCRIPTOR_LABEL,
    VOLUME_PAYLOAD_LABEL,
    STATE_PAYLOAD_LABEL,
];

/// Everything the driver owns for one attached sound card
///
/// Fields drop in declaration order, which is the reverse of the order
/// attach acquires them. The context's own reservation is released last.
pub struct SoundCard {
    state_payload: DmaBuf,
    volume_payload: DmaBuf,
    state_descriptor: DmaBuf,
    volume_descriptor: DmaBuf,
    urb: Urb,
    pipe: Arc<dyn ControlPipe>,
    state: Mutex<HandshakeState>,
    _allocation: Allocation,
}

/// Resources acquired by attach, newest first
pub(crate) struct Resources {
    pub state_payload: DmaBuf,
    pub volume_payload: DmaBuf,
    pub state_descriptor: DmaBuf,
    pub volume_descriptor: DmaBuf,
    pub urb: Urb,
    pub allocation: Allocation,
}

impl SoundCard {
    pub(crate) fn new(pipe: Arc<dyn ControlPipe>, resources: Resources) -> Self {
        let Resources {
            allocation,
            urb,
            volume_descriptor,
            state_descriptor,
            volume_payload,
            state_payload,
        } = resources;

        Self {
            state_payload,
            volume_payload,
            state_descriptor,
            volume_descriptor,
            urb,
            pipe,
            state: Mutex::new(HandshakeState::Idle),
            _allocation: allocation,
        }
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn advance(&self, next: HandshakeState) -> Result<(), IllegalTransition> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(next)
    }

    pub fn urb(&self) -> &Urb {
        &self.urb
    }

    pub fn volume_descriptor(&self) -> &DmaBuf {
        &self.volume_descriptor
    }

    pub fn state_descriptor(&self) -> &DmaBuf {
        &self.state_descriptor
    }

    pub fn volume_payload(&self) -> &DmaBuf {
        &self.volume_payload
    }

    pub fn state_payload(&self) -> &DmaBuf {
        &self.state_payload
    }

    /// Bind the request to the set-volume command
    pub(crate) fn volume_transfer(&self, complete: CompleteFn, device: &BusDevice) -> ControlUrb {
        ControlUrb::new(
            Arc::clone(&self.pipe),
            self.volume_descriptor.clone(),
            self.volume_payload.clone(),
            complete,
            device.clone(),
        )
    }

    /// Bind the request to the set-state command
    pub(crate) fn state_transfer(&self, complete: CompleteFn, device: &BusDevice) -> ControlUrb {
        ControlUrb::new(
            Arc::clone(&self.pipe),
            self.state_descriptor.clone(),
            self.state_payload.clone(),
            complete,
            device.clone(),
        )
    }
}

impl fmt::Debug for SoundCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoundCard")
            .field("state", &self.state())
            .field("urb", &self.urb)
            .field("volume_descriptor", &self.volume_descriptor)
            .field("state_descriptor", &self.state_descriptor)
            .field("volume_payload", &self.volume_payload)
            .field("state_payload", &self.state_payload)
            .finish()
    }
}
