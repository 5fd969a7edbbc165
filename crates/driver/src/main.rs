//! rzrst daemon
//!
//! Watches for Razer USB Sound Cards and turns on microphone sidetone when
//! one is plugged in.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, setup_logging};
use driver::config::{self, DaemonConfig};
use driver::service;
use driver::usb::spawn_usb_worker;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rzrst")]
#[command(
    author,
    version,
    about = "Enable microphone sidetone on Razer USB Sound Cards"
)]
#[command(long_about = "
Binds to Razer USB Sound Cards (1532:0529) as they are plugged in and sends
the two vendor control requests that set the sidetone volume and switch
sidetone on.

EXAMPLES:
    # Run with default config
    rzrst

    # Run with custom config
    rzrst --config ~/rzrst.toml

    # List matching sound cards and exit
    rzrst --list-devices

    # Run under systemd
    rzrst --service

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rzrst/rzrst.toml
    3. /etc/rzrst/rzrst.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service
    #[arg(long)]
    service: bool,

    /// List matching sound cards and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    config::validate_log_level(log_level)?;

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rzrst v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(worker, config.usb.clone())
        .context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(usb_bridge.clone()).await
    } else {
        let service_mode = args.service || config.daemon.service_mode;
        run_service(service_mode, usb_bridge.clone()).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = shutdown_usb_worker(usb_bridge).await {
        error!("Error shutting down USB worker: {:#}", e);
    }

    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// List matching sound cards and exit
async fn list_devices_mode(usb_bridge: UsbBridge) -> Result<()> {
    usb_bridge
        .wait_ready(|_| {})
        .await
        .context("USB worker failed to start")?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    usb_bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;

    let devices = rx
        .await
        .map_err(|_| anyhow!("USB worker exited before listing devices"))?;

    if devices.is_empty() {
        println!("No Razer USB Sound Card found.");
    } else {
        println!("Found {} sound card(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x} - {}",
                device.vendor_id,
                device.product_id,
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03}",
                device.bus_number, device.address
            );
            if let Some(serial) = &device.serial_number {
                println!("      Serial: {}", serial);
            }
            println!();
        }
    }

    Ok(())
}

/// Run until Ctrl+C, logging device lifecycle events
async fn run_service(service_mode: bool, usb_bridge: UsbBridge) -> Result<()> {
    if service_mode {
        info!("Running in service mode");
    }
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let mut attached = usb_bridge
        .wait_ready(log_event)
        .await
        .context("USB worker failed to start")?;
    info!("USB worker ready, {} sound card(s) bound", attached);

    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status(&format!("{} sound card(s) bound", attached))
        .context("Failed to send status to systemd")?;

    let events_bridge = usb_bridge.clone();
    let events_handle = tokio::spawn(async move {
        while let Ok(event) = events_bridge.recv_event().await {
            match &event {
                UsbEvent::DeviceAttached { .. } => attached += 1,
                UsbEvent::DeviceDetached { .. } => attached = attached.saturating_sub(1),
                UsbEvent::AttachFailed { .. } | UsbEvent::Ready { .. } => {}
            }
            log_event(event);

            if let Err(e) = service::notify_status(&format!("{} sound card(s) bound", attached)) {
                warn!("Failed to send status to systemd: {:#}", e);
            }
        }
    });

    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    service::notify_stopping().context("Failed to notify systemd stopping")?;
    events_handle.abort();

    Ok(())
}

fn log_event(event: UsbEvent) {
    match event {
        UsbEvent::Ready { bound } => {
            debug!("Repeated ready from USB worker, {} bound", bound);
        }
        UsbEvent::DeviceAttached { device } => {
            info!(
                "Sound card attached at bus {:03} device {:03}",
                device.bus_number, device.address
            );
        }
        UsbEvent::AttachFailed { device, status } => {
            warn!(
                "Sound card at bus {:03} device {:03} refused: {}",
                device.bus_number, device.address, status
            );
        }
        UsbEvent::DeviceDetached { device } => {
            info!(
                "Sound card detached from bus {:03} device {:03}",
                device.bus_number, device.address
            );
        }
    }
}

/// Shutdown USB worker thread gracefully
async fn shutdown_usb_worker(usb_bridge: UsbBridge) -> Result<()> {
    usb_bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .context("Failed to send Shutdown command")?;
    Ok(())
}
