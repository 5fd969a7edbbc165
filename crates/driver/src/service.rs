//! Systemd service integration
//!
//! Minimal sd-notify support: readiness, stopping and status messages sent
//! as datagrams to `$NOTIFY_SOCKET`. Outside systemd every call is a no-op.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use tracing::{debug, info};

/// Notify systemd that the service is ready
///
/// Call once the USB worker has reported ready.
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    }
    Ok(())
}

/// Notify systemd that the service is stopping
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Send a custom status message to systemd
///
/// The status will be visible in `systemctl status` output.
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Check if running under systemd
pub fn is_systemd() -> bool {
    env::var_os("NOTIFY_SOCKET").is_some()
}

/// Send `message` to `$NOTIFY_SOCKET`, returning false if it is unset
fn notify(message: &str) -> Result<bool> {
    match env::var_os("NOTIFY_SOCKET") {
        Some(socket_path) => {
            send_to(Path::new(&socket_path), message)?;
            Ok(true)
        }
        None => {
            debug!("NOTIFY_SOCKET not set, skipping systemd notification");
            Ok(false)
        }
    }
}

fn send_to(socket_path: &Path, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(())
}
