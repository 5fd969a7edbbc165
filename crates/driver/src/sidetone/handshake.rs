//! Completion handlers for the two-step sidetone handshake
//!
//! Both transfers complete into [`handshake_complete`], which looks the
//! device's [`SoundCard`] up in the driver-data slot and dispatches on the
//! handshake state: a set-volume completion queues set-state on the same
//! request, a set-state completion ends the handshake. Nothing is retried.

use super::context::SoundCard;
use super::error::{DriverError, Stage};
use super::state::{HandshakeState, Outcome};
use common::hostbus::{BusDevice, Completion};
use tracing::{debug, error, info, warn};

/// Completion entry point for every sidetone transfer
pub(crate) fn handshake_complete(completion: &Completion<'_>) {
    let device = completion.context;

    let Some(card) = device.drvdata::<SoundCard>() else {
        warn!("{}: completion without driver context, ignoring", device);
        return;
    };

    debug!(
        "{}: transfer value={:#06x} finished: {}, {} bytes",
        device, completion.setup.value, completion.status, completion.actual_length
    );

    match card.state() {
        HandshakeState::VolumeSubmitted => volume_set(&card, device, completion),
        HandshakeState::StateSubmitted => state_set(&card, device, completion),
        state => error!("{}: unexpected completion in state {}", device, state),
    }
}

/// Set-volume finished: queue set-state or stop
fn volume_set(card: &SoundCard, device: &BusDevice, completion: &Completion<'_>) {
    if !completion.status.is_success() {
        let err = DriverError::Transfer {
            stage: Stage::Volume,
            status: completion.status,
        };
        error!("{}: {}", device, err);
        finish(card, device, Outcome::VolumeFailed);
        return;
    }

    if let Err(err) = card.advance(HandshakeState::StateSubmitted) {
        error!("{}: {}", device, err);
        return;
    }

    if let Err(error) = card.urb().submit(card.state_transfer(handshake_complete, device)) {
        let err = DriverError::Submission {
            stage: Stage::State,
            error,
        };
        error!("{}: {} ({})", device, err, err.errno());
        finish(card, device, Outcome::StateSubmitFailed);
    }
}

/// Set-state finished: the handshake is over either way
fn state_set(card: &SoundCard, device: &BusDevice, completion: &Completion<'_>) {
    if completion.status.is_success() {
        info!("{}: sidetone enabled", device);
        finish(card, device, Outcome::Success);
    } else {
        let err = DriverError::Transfer {
            stage: Stage::State,
            status: completion.status,
        };
        error!("{}: {}", device, err);
        finish(card, device, Outcome::StateFailed);
    }
}

fn finish(card: &SoundCard, device: &BusDevice, outcome: Outcome) {
    if let Err(err) = card.advance(HandshakeState::Terminated(outcome)) {
        error!("{}: {}", device, err);
    }
}
