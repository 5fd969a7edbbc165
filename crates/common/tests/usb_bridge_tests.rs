//! USB Bridge Integration Tests
//!
//! Tests for the async channel bridge between Tokio runtime and USB thread.
//!
//! # Test Scenarios
//! - Command/response flow for device queries
//! - Lifecycle event delivery and ordering
//! - Shutdown and channel closure
//! - Event backpressure
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_device_info, recv_command, with_timeout};
use common::{Error, UsbCommand, UsbEvent, create_usb_bridge};
use protocol::{RAZER_USB_SOUND_CARD_PID, RAZER_VID};
use std::thread;
use tokio::sync::oneshot;

// ============================================================================
// UsbCommand Message Flow Tests
// ============================================================================

#[tokio::test]
async fn test_list_devices_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Some(UsbCommand::ListDevices { response }) = recv_command(&worker) {
            let devices = (1..=3)
                .map(|addr| create_mock_device_info(addr, RAZER_VID, RAZER_USB_SOUND_CARD_PID))
                .collect();
            let _ = response.send(devices);
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .expect("Failed to send command");

    let devices = with_timeout(DEFAULT_TEST_TIMEOUT, rx)
        .await
        .expect("Timed out")
        .expect("Failed to receive response");
    assert_eq!(devices.len(), 3);
    assert!(devices.iter().all(|d| d.vendor_id == RAZER_VID));

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_bound_devices_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Some(UsbCommand::BoundDevices { response }) = recv_command(&worker) {
            let _ = response.send(Vec::new());
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::BoundDevices { response: tx })
        .await
        .unwrap();

    let devices = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(devices.is_empty());

    handle.join().unwrap();
}

#[tokio::test]
async fn test_shutdown_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        let mut handled = 0;
        while let Some(cmd) = recv_command(&worker) {
            handled += 1;
            if matches!(cmd, UsbCommand::Shutdown) {
                break;
            }
        }
        handled
    });

    bridge.send_command(UsbCommand::Shutdown).await.unwrap();
    assert_eq!(handle.join().unwrap(), 1);
}

#[tokio::test]
async fn test_send_after_worker_dropped_fails() {
    let (bridge, worker) = create_usb_bridge();
    drop(worker);

    let result = bridge.send_command(UsbCommand::Shutdown).await;
    assert!(matches!(result, Err(Error::Channel(_))));
}

// ============================================================================
// UsbEvent Message Flow Tests
// ============================================================================

#[tokio::test]
async fn test_lifecycle_events_arrive_in_order() {
    let (bridge, worker) = create_usb_bridge();
    let device = create_mock_device_info(4, RAZER_VID, RAZER_USB_SOUND_CARD_PID);

    let sent = device.clone();
    thread::spawn(move || {
        worker
            .send_event(UsbEvent::DeviceAttached {
                device: sent.clone(),
            })
            .unwrap();
        worker
            .send_event(UsbEvent::DeviceDetached { device: sent })
            .unwrap();
    })
    .join()
    .unwrap();

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, UsbEvent::DeviceAttached { device: ref d } if *d == device));

    let second = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, UsbEvent::DeviceDetached { device: ref d } if *d == device));
}

#[tokio::test]
async fn test_attach_failed_carries_status() {
    let (bridge, worker) = create_usb_bridge();
    let device = create_mock_device_info(7, RAZER_VID, RAZER_USB_SOUND_CARD_PID);

    worker
        .send_event(UsbEvent::AttachFailed {
            device: device.clone(),
            status: -12,
        })
        .unwrap();

    match bridge.recv_event().await.unwrap() {
        UsbEvent::AttachFailed { device: d, status } => {
            assert_eq!(d, device);
            assert_eq!(status, -12);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_ready_hands_over_earlier_events() {
    let (bridge, worker) = create_usb_bridge();
    let device = create_mock_device_info(2, RAZER_VID, RAZER_USB_SOUND_CARD_PID);

    let sent = device.clone();
    thread::spawn(move || {
        worker
            .send_event(UsbEvent::DeviceAttached { device: sent })
            .unwrap();
        worker.announce_ready(1).unwrap();
        worker
            .send_event(UsbEvent::DeviceDetached {
                device: create_mock_device_info(2, RAZER_VID, RAZER_USB_SOUND_CARD_PID),
            })
            .unwrap();
    })
    .join()
    .unwrap();

    let mut early = Vec::new();
    let bound = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.wait_ready(|e| early.push(e)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(bound, 1);
    assert_eq!(early.len(), 1);
    assert!(matches!(early[0], UsbEvent::DeviceAttached { device: ref d } if *d == device));

    // Events after Ready stay queued for the regular receiver
    let next = bridge.recv_event().await.unwrap();
    assert!(matches!(next, UsbEvent::DeviceDetached { .. }));
}

#[tokio::test]
async fn test_wait_ready_fails_when_worker_exits() {
    let (bridge, worker) = create_usb_bridge();
    thread::spawn(move || drop(worker)).join().unwrap();

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.wait_ready(|_| {}))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Channel(_))));
}

#[tokio::test]
async fn test_recv_after_worker_dropped_fails() {
    let (bridge, worker) = create_usb_bridge();
    drop(worker);

    assert!(matches!(bridge.recv_event().await, Err(Error::Channel(_))));
}

// ============================================================================
// Backpressure Tests
// ============================================================================

#[test]
fn test_events_dropped_when_runtime_not_draining() {
    let (_bridge, worker) = create_usb_bridge();
    let device = create_mock_device_info(1, RAZER_VID, RAZER_USB_SOUND_CARD_PID);

    let mut refused = 0;
    for _ in 0..100 {
        let event = UsbEvent::DeviceAttached {
            device: device.clone(),
        };
        if worker.send_event(event).is_err() {
            refused += 1;
        }
    }

    // The worker never blocks; overflow is reported instead
    assert!(refused > 0);
    assert!(refused < 100);
}

#[test]
fn test_try_recv_command_is_non_blocking() {
    let (_bridge, worker) = create_usb_bridge();
    assert!(worker.try_recv_command().is_none());
}
