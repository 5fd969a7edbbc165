//! USB worker thread
//!
//! Dedicated thread that owns the libusb context. It pumps
//! `handle_events()` so hotplug callbacks fire, binds and unbinds the driver,
//! and answers commands from the Tokio runtime. Control transfers never run
//! here; they run on each request's completion thread.

use crate::config::UsbSettings;
use crate::usb::manager::DeviceManager;
use common::{UsbCommand, UsbWorker};
use rusb::UsbContext;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// USB worker thread
///
/// Manages the USB context, device manager, and event loop.
pub struct UsbWorkerThread {
    /// Device manager for USB operations
    manager: DeviceManager,
    /// Communication channel with Tokio runtime
    worker: UsbWorker,
    /// libusb event pump timeout
    poll: Duration,
}

impl UsbWorkerThread {
    /// Create a new USB worker thread
    ///
    /// Binds devices already present and then reports ready to the runtime.
    /// If libusb cannot be set up the worker is dropped unannounced, which
    /// closes the event channel.
    pub fn new(worker: UsbWorker, settings: UsbSettings) -> Result<Self, rusb::Error> {
        let poll = settings.event_poll();
        let mut manager = DeviceManager::new(worker.event_tx.clone(), settings)?;

        manager.initialize()?;

        let bound = manager.bound_devices().len();
        if let Err(e) = worker.announce_ready(bound) {
            warn!("Runtime gone before USB worker was ready: {}", e);
        }

        Ok(Self {
            manager,
            worker,
            poll,
        })
    }

    /// Run the USB worker thread event loop
    ///
    /// Each pass handles pending commands, pumps libusb events, then acts on
    /// whatever the hotplug callback forwarded. On `Shutdown` every bound
    /// device is detached before the loop exits.
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => {
                    self.handle_command(cmd);
                }
                None => {}
            }

            match self.manager.context().handle_events(Some(self.poll)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(self.poll);
                }
            }

            self.manager.process_hotplug_events();

            if self.manager.needs_polling()
                && let Err(e) = self.manager.rescan()
            {
                warn!("Device rescan failed: {}", e);
            }
        }

        self.manager.detach_all();
        info!("USB worker thread stopped");
        Ok(())
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::BoundDevices { response } => {
                let devices = self.manager.bound_devices();
                debug!("{} bound devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::Shutdown => {
                // Handled in the main loop
                warn!("Shutdown reached the command handler, ignoring");
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or libusb fails to
/// initialise.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    settings: UsbSettings,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, settings)?;
            worker_thread.run()
        })
}
