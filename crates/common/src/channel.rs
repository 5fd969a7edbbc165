//! Async channel bridge between Tokio runtime and USB thread

use crate::hostbus::DeviceInfo;
use async_channel::{Receiver, Sender, bounded};

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List connected devices that match the driver's table
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceInfo>>,
    },

    /// List devices the driver is currently bound to
    BoundDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceInfo>>,
    },

    /// Detach every bound device and stop the USB thread
    Shutdown,
}

/// Device lifecycle events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// libusb is up and devices present at startup have been bound
    Ready {
        /// Devices bound during startup
        bound: usize,
    },

    /// Driver attached to a device and queued the sidetone handshake
    DeviceAttached {
        /// Device identity
        device: DeviceInfo,
    },

    /// Attach was refused; the device stays unbound
    AttachFailed {
        /// Device identity
        device: DeviceInfo,
        /// Negative errno returned by attach
        status: i32,
    },

    /// Driver released a device
    DeviceDetached {
        /// Device identity
        device: DeviceInfo,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Wait for the USB thread to report it is ready
    ///
    /// Lifecycle events that arrive first are handed to `on_event`. Returns
    /// the number of devices bound at startup, or an error if the thread
    /// exited without getting ready.
    pub async fn wait_ready(&self, mut on_event: impl FnMut(UsbEvent)) -> crate::Result<usize> {
        loop {
            match self.recv_event().await? {
                UsbEvent::Ready { bound } => return Ok(bound),
                event => on_event(event),
            }
        }
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime without blocking the USB thread
    ///
    /// Events are informational; if the runtime is not draining them they
    /// are dropped rather than stalling hotplug handling.
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Tell the runtime startup is done
    ///
    /// Blocks until there is room; unlike lifecycle events this one must
    /// not be lost.
    pub fn announce_ready(&self, bound: usize) -> crate::Result<()> {
        self.event_tx
            .send_blocking(UsbEvent::Ready { bound })
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(64);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Spawn a thread to simulate USB worker
        let handle = std::thread::spawn(move || {
            let cmd = crate::test_utils::recv_command(&worker).unwrap();
            matches!(cmd, UsbCommand::ListDevices { .. })
        });

        // Send command from async context
        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }
}
