//! Test utilities for rzrst
//!
//! Provides a mock host bus and helpers for testing drivers without hardware.
//! The mock records everything that happens on the bus in a shared
//! [`Journal`]: descriptor parses, channel start/stop, every allocation and
//! release, and every transfer start and finish. Tests assert on ordering by
//! inspecting the journal.
//!
//! # Example
//!
//! ```
//! use common::hostbus::HostBus;
//! use common::test_utils::{MockBus, create_mock_sound_card};
//!
//! let bus = MockBus::new();
//! let device = create_mock_sound_card(3);
//! assert!(bus.parse(&device).is_ok());
//! assert_eq!(bus.journal().snapshot().len(), 1);
//! ```

use crate::hostbus::{Allocator, BusDevice, BusError, ControlPipe, DeviceInfo, HostBus, Transport};
use crate::{UsbCommand, UsbWorker};
use protocol::{ControlRequest, RAZER_USB_SOUND_CARD_PID, RAZER_VID, TransferStatus};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on the mock bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Parsed((u8, u8)),
    ChannelStarted((u8, u8)),
    ChannelStopped((u8, u8)),
    Acquired(&'static str),
    Released(&'static str),
    TransferStarted {
        device: (u8, u8),
        setup: ControlRequest,
        data: Vec<u8>,
    },
    TransferFinished {
        device: (u8, u8),
        setup: ControlRequest,
        status: TransferStatus,
    },
}

/// Shared, ordered record of bus events
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl Journal {
    pub fn push(&self, event: BusEvent) {
        lock(&self.events).push(event);
    }

    pub fn snapshot(&self) -> Vec<BusEvent> {
        lock(&self.events).clone()
    }

    /// Index of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&BusEvent) -> bool) -> Option<usize> {
        lock(&self.events).iter().position(pred)
    }

    /// Number of events matching `pred`
    pub fn count(&self, pred: impl Fn(&BusEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| pred(e)).count()
    }

    /// Labels released, in order
    pub fn released(&self) -> Vec<&'static str> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                BusEvent::Released(label) => Some(*label),
                _ => None,
            })
            .collect()
    }

    /// Labels acquired, in order
    pub fn acquired(&self) -> Vec<&'static str> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                BusEvent::Acquired(label) => Some(*label),
                _ => None,
            })
            .collect()
    }

    /// Setup packets of transfers that reached the pipe, in order
    pub fn transfers(&self) -> Vec<ControlRequest> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                BusEvent::TransferStarted { setup, .. } => Some(*setup),
                _ => None,
            })
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocator that journals every acquire/release and can be told to fail
#[derive(Debug)]
pub struct MockAllocator {
    journal: Journal,
    fail_label: Mutex<Option<&'static str>>,
    live: Mutex<Vec<&'static str>>,
}

impl MockAllocator {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail_label: Mutex::new(None),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Make every acquisition of `label` fail with `NoMemory`
    pub fn fail_on(&self, label: &'static str) {
        *lock(&self.fail_label) = Some(label);
    }

    pub fn clear_failure(&self) {
        *lock(&self.fail_label) = None;
    }

    /// Labels currently held
    pub fn live(&self) -> Vec<&'static str> {
        lock(&self.live).clone()
    }
}

impl Allocator for MockAllocator {
    fn acquire(&self, label: &'static str, _size: usize) -> Result<(), BusError> {
        if *lock(&self.fail_label) == Some(label) {
            return Err(BusError::NoMemory);
        }
        lock(&self.live).push(label);
        self.journal.push(BusEvent::Acquired(label));
        Ok(())
    }

    fn release(&self, label: &'static str, _size: usize) {
        let mut live = lock(&self.live);
        match live.iter().position(|l| *l == label) {
            Some(idx) => {
                live.remove(idx);
            }
            None => panic!("double release of {}", label),
        }
        drop(live);
        self.journal.push(BusEvent::Released(label));
    }
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    entered: usize,
}

/// Control pipe with scripted outcomes and a gate for completion timing
#[derive(Debug)]
pub struct ScriptedPipe {
    device: (u8, u8),
    journal: Journal,
    script: Mutex<VecDeque<TransferStatus>>,
    submit_error: Mutex<Option<BusError>>,
    gate: Mutex<GateState>,
    gate_changed: Condvar,
}

impl ScriptedPipe {
    pub fn new(device: (u8, u8), journal: Journal) -> Self {
        Self {
            device,
            journal,
            script: Mutex::new(VecDeque::new()),
            submit_error: Mutex::new(None),
            gate: Mutex::new(GateState::default()),
            gate_changed: Condvar::new(),
        }
    }

    /// Queue the outcome of the next unscripted transfer
    ///
    /// Transfers with no scripted outcome complete successfully.
    pub fn push_status(&self, status: TransferStatus) {
        lock(&self.script).push_back(status);
    }

    /// Refuse every submission with `error` until cleared
    pub fn fail_submit(&self, error: BusError) {
        *lock(&self.submit_error) = Some(error);
    }

    pub fn clear_submit_failure(&self) {
        *lock(&self.submit_error) = None;
    }

    /// Block transfers inside the pipe until [`ScriptedPipe::open`]
    pub fn hold(&self) {
        lock(&self.gate).held = true;
    }

    /// Let held and future transfers through
    pub fn open(&self) {
        lock(&self.gate).held = false;
        self.gate_changed.notify_all();
    }

    /// Wait until `count` transfers have entered the pipe
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = lock(&self.gate);
        while gate.entered < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gate = self
                .gate_changed
                .wait_timeout(gate, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Transfers that entered the pipe so far
    pub fn entered(&self) -> usize {
        lock(&self.gate).entered
    }
}

impl ControlPipe for ScriptedPipe {
    fn accept(&self, _setup: &ControlRequest) -> Result<(), BusError> {
        match lock(&self.submit_error).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn control_out(&self, setup: &ControlRequest, data: &[u8]) -> Result<usize, TransferStatus> {
        self.journal.push(BusEvent::TransferStarted {
            device: self.device,
            setup: *setup,
            data: data.to_vec(),
        });

        {
            let mut gate = lock(&self.gate);
            gate.entered += 1;
            self.gate_changed.notify_all();
            while gate.held {
                gate = self
                    .gate_changed
                    .wait(gate)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        let status = lock(&self.script)
            .pop_front()
            .unwrap_or(TransferStatus::Completed);

        self.journal.push(BusEvent::TransferFinished {
            device: self.device,
            setup: *setup,
            status,
        });

        if status.is_success() {
            Ok(data.len())
        } else {
            Err(status)
        }
    }
}

/// In-process host bus
pub struct MockBus {
    journal: Journal,
    allocator: Arc<MockAllocator>,
    pipes: Mutex<HashMap<(u8, u8), Arc<ScriptedPipe>>>,
    parse_error: Mutex<Option<i32>>,
    start_error: Mutex<Option<i32>>,
}

impl MockBus {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            allocator: Arc::new(MockAllocator::new(journal.clone())),
            journal,
            pipes: Mutex::new(HashMap::new()),
            parse_error: Mutex::new(None),
            start_error: Mutex::new(None),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn mock_allocator(&self) -> &Arc<MockAllocator> {
        &self.allocator
    }

    /// Pipe that `hw_start` hands out for `device`
    pub fn pipe(&self, device: &BusDevice) -> Arc<ScriptedPipe> {
        let key = device.key();
        Arc::clone(
            lock(&self.pipes)
                .entry(key)
                .or_insert_with(|| Arc::new(ScriptedPipe::new(key, self.journal.clone()))),
        )
    }

    /// Make descriptor parsing fail with `code`
    pub fn fail_parse(&self, code: i32) {
        *lock(&self.parse_error) = Some(code);
    }

    /// Make channel start fail with `code`
    pub fn fail_start(&self, code: i32) {
        *lock(&self.start_error) = Some(code);
    }

    /// Make transfer submission on `device`'s pipe fail with `error`
    pub fn fail_submit(&self, device: &BusDevice, error: BusError) {
        self.pipe(device).fail_submit(error);
    }

    /// True if the channel for `device` is started and not yet stopped
    pub fn channel_running(&self, device: &BusDevice) -> bool {
        let key = device.key();
        let started = self
            .journal
            .count(|e| *e == BusEvent::ChannelStarted(key));
        let stopped = self
            .journal
            .count(|e| *e == BusEvent::ChannelStopped(key));
        started > stopped
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBus for MockBus {
    fn parse(&self, device: &BusDevice) -> Result<(), BusError> {
        if let Some(code) = *lock(&self.parse_error) {
            return Err(BusError::Parse(code));
        }
        self.journal.push(BusEvent::Parsed(device.key()));
        Ok(())
    }

    fn hw_start(&self, device: &BusDevice) -> Result<Arc<dyn ControlPipe>, BusError> {
        if let Some(code) = *lock(&self.start_error) {
            return Err(BusError::Start(code));
        }
        self.journal.push(BusEvent::ChannelStarted(device.key()));
        let pipe: Arc<dyn ControlPipe> = self.pipe(device);
        Ok(pipe)
    }

    fn hw_stop(&self, device: &BusDevice) {
        self.journal.push(BusEvent::ChannelStopped(device.key()));
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }
}

/// Create a mock DeviceInfo for testing
pub fn create_mock_device_info(address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        vendor_id,
        product_id,
        bus_number: 1,
        address,
        product: Some(format!("Test Product {}", address)),
        serial_number: Some(format!("SN{:06}", address)),
    }
}

/// Create a mock device on an arbitrary transport
pub fn create_mock_bus_device(
    address: u8,
    vendor_id: u16,
    product_id: u16,
    transport: Transport,
) -> BusDevice {
    BusDevice::new(
        create_mock_device_info(address, vendor_id, product_id),
        transport,
    )
}

/// Create a mock Razer USB Sound Card at `address` on bus 1
pub fn create_mock_sound_card(address: u8) -> BusDevice {
    create_mock_bus_device(
        address,
        RAZER_VID,
        RAZER_USB_SOUND_CARD_PID,
        Transport::Usb,
    )
}

/// Block the calling thread until the runtime sends `worker` a command
///
/// Returns `None` once every bridge handle is gone.
pub fn recv_command(worker: &UsbWorker) -> Option<UsbCommand> {
    worker.cmd_rx.recv_blocking().ok()
}

/// Poll `pred` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
