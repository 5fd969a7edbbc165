//! Asynchronous control request object
//!
//! A [`Urb`] is allocated once and reused for any number of sequential
//! control transfers. Submission only enqueues and returns; the transfer and
//! its completion handler run on the request's own completion thread.
//!
//! Guarantees:
//! - at most one completion handler runs at a time, and a second submission
//!   is refused with [`BusError::Busy`] while one is outstanding. The only
//!   exception is a resubmission from inside the request's own completion
//!   handler.
//! - [`Urb::kill`] blocks until the request is idle: any queued transfer has
//!   completed with [`TransferStatus::Cancelled`], the completion handler has
//!   returned, and the request has dropped its buffer handles. Submissions
//!   made while a kill is in progress fail with [`BusError::Rejected`].

use super::{Allocation, Allocator, BusDevice, BusError, ControlPipe, DmaBuf};
use protocol::{ControlRequest, TransferStatus};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace, warn};

/// What a completion handler sees
pub struct Completion<'a> {
    /// Transfer outcome
    pub status: TransferStatus,
    /// Bytes moved in the data stage
    pub actual_length: usize,
    /// Setup packet of the finished transfer
    pub setup: ControlRequest,
    /// Opaque context bound at submission
    pub context: &'a BusDevice,
}

/// Completion continuation
pub type CompleteFn = fn(&Completion<'_>);

/// A control transfer binding: pipe, setup packet, data stage, continuation
pub struct ControlUrb {
    pipe: Arc<dyn ControlPipe>,
    setup: DmaBuf,
    data: DmaBuf,
    complete: CompleteFn,
    context: BusDevice,
}

impl ControlUrb {
    pub fn new(
        pipe: Arc<dyn ControlPipe>,
        setup: DmaBuf,
        data: DmaBuf,
        complete: CompleteFn,
        context: BusDevice,
    ) -> Self {
        Self {
            pipe,
            setup,
            data,
            complete,
            context,
        }
    }

    pub fn setup(&self) -> &DmaBuf {
        &self.setup
    }

    pub fn data(&self) -> &DmaBuf {
        &self.data
    }
}

impl fmt::Debug for ControlUrb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlUrb")
            .field("setup", &self.setup)
            .field("data", &self.data)
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Queued,
    Running,
    Completing,
}

struct Submission {
    urb: ControlUrb,
    setup: ControlRequest,
}

struct UrbState {
    phase: Phase,
    queued: Option<Submission>,
    reject: u32,
    shutdown: bool,
    submitted: u64,
}

struct UrbShared {
    label: &'static str,
    state: Mutex<UrbState>,
    changed: Condvar,
}

impl UrbShared {
    fn lock(&self) -> MutexGuard<'_, UrbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, UrbState>) -> MutexGuard<'a, UrbState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reusable asynchronous control request
pub struct Urb {
    shared: Arc<UrbShared>,
    completion_thread: ThreadId,
    worker: Option<JoinHandle<()>>,
    _allocation: Allocation,
}

impl Urb {
    /// Allocate a request object and start its completion context
    pub fn alloc(allocator: &Arc<dyn Allocator>, label: &'static str) -> Result<Self, BusError> {
        let allocation = Allocation::new(allocator, label, std::mem::size_of::<UrbState>())?;

        let shared = Arc::new(UrbShared {
            label,
            state: Mutex::new(UrbState {
                phase: Phase::Idle,
                queued: None,
                reject: 0,
                shutdown: false,
                submitted: 0,
            }),
            changed: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("urb-complete".to_string())
            .spawn(move || completion_loop(worker_shared))
            .map_err(|e| {
                warn!("Failed to start completion context for {}: {}", label, e);
                BusError::NoMemory
            })?;

        let completion_thread = worker.thread().id();

        Ok(Self {
            shared,
            completion_thread,
            worker: Some(worker),
            _allocation: allocation,
        })
    }

    /// Bind the request to `urb` and queue it
    ///
    /// Returns as soon as the transfer is queued. The continuation in `urb`
    /// runs later on the completion context.
    pub fn submit(&self, urb: ControlUrb) -> Result<(), BusError> {
        let setup = ControlRequest::from_bytes(urb.setup.as_slice())
            .map_err(|e| BusError::InvalidRequest(e.to_string()))?;
        setup
            .check_payload(urb.data.as_slice())
            .map_err(|e| BusError::InvalidRequest(e.to_string()))?;

        let from_own_completion = thread::current().id() == self.completion_thread;
        let mut state = self.shared.lock();

        if state.shutdown {
            return Err(BusError::NoDevice);
        }
        if state.reject > 0 {
            return Err(BusError::Rejected);
        }

        match state.phase {
            Phase::Idle => {}
            Phase::Completing if from_own_completion && state.queued.is_none() => {}
            _ => return Err(BusError::Busy),
        }

        urb.pipe.accept(&setup)?;

        trace!(
            "{}: queued request_type={:#x}, request={:#x}, value={:#06x}, index={:#06x}, len={}",
            self.shared.label,
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );

        state.queued = Some(Submission { urb, setup });
        state.phase = Phase::Queued;
        state.submitted += 1;
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Cancel the outstanding transfer and wait for it to finish
    ///
    /// Blocks until no transfer is queued or running and no completion
    /// handler is executing. Must not be called from this request's own
    /// completion handler.
    pub fn kill(&self) {
        if thread::current().id() == self.completion_thread {
            error!(
                "{}: kill from its own completion context would deadlock, ignoring",
                self.shared.label
            );
            return;
        }

        let mut state = self.shared.lock();
        state.reject += 1;
        self.shared.changed.notify_all();

        while state.phase != Phase::Idle {
            state = self.shared.wait(state);
        }

        state.reject -= 1;
        debug!("{}: killed", self.shared.label);
    }

    /// True if nothing is queued, running or completing
    pub fn is_idle(&self) -> bool {
        self.shared.lock().phase == Phase::Idle
    }

    /// True while a kill is waiting for the request to go idle
    pub fn is_cancelling(&self) -> bool {
        self.shared.lock().reject > 0
    }

    /// Number of accepted submissions so far
    pub fn submitted(&self) -> u64 {
        self.shared.lock().submitted
    }
}

impl Drop for Urb {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }

        let Some(worker) = self.worker.take() else {
            return;
        };

        // The completion thread exits on its own once it sees `shutdown`
        if thread::current().id() == self.completion_thread {
            return;
        }

        if worker.join().is_err() {
            error!("{}: completion context panicked", self.shared.label);
        }
    }
}

impl fmt::Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Urb")
            .field("label", &self.shared.label)
            .field("phase", &state.phase)
            .field("submitted", &state.submitted)
            .finish()
    }
}

fn completion_loop(shared: Arc<UrbShared>) {
    loop {
        let (submission, cancelled) = {
            let mut state = shared.lock();
            let submission = loop {
                if let Some(submission) = state.queued.take() {
                    break submission;
                }
                if state.shutdown {
                    return;
                }
                state = shared.wait(state);
            };
            state.phase = Phase::Running;
            (submission, state.reject > 0 || state.shutdown)
        };

        run_submission(&shared, submission, cancelled);

        let mut state = shared.lock();
        state.phase = if state.queued.is_some() {
            Phase::Queued
        } else {
            Phase::Idle
        };
        shared.changed.notify_all();
    }
}

fn run_submission(shared: &UrbShared, submission: Submission, cancelled: bool) {
    let Submission { urb, setup } = submission;

    let (status, actual_length) = if cancelled {
        (TransferStatus::Cancelled, 0)
    } else {
        let transfer = catch_unwind(AssertUnwindSafe(|| {
            urb.pipe.control_out(&setup, urb.data.as_slice())
        }));
        match transfer {
            Ok(Ok(len)) => (TransferStatus::Completed, len),
            Ok(Err(status)) => (status, 0),
            Err(_) => {
                error!("{}: panic in control pipe", shared.label);
                (TransferStatus::Io, 0)
            }
        }
    };

    shared.lock().phase = Phase::Completing;

    let completion = Completion {
        status,
        actual_length,
        setup,
        context: &urb.context,
    };

    if catch_unwind(AssertUnwindSafe(|| (urb.complete)(&completion))).is_err() {
        error!("{}: panic in completion handler", shared.label);
    }

    // Buffer handles go before the request reports idle
    drop(urb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostbus::{DeviceInfo, SystemAllocator, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct OkPipe;

    impl ControlPipe for OkPipe {
        fn control_out(
            &self,
            _setup: &ControlRequest,
            data: &[u8],
        ) -> Result<usize, TransferStatus> {
            Ok(data.len())
        }
    }

    fn device() -> BusDevice {
        BusDevice::new(
            DeviceInfo {
                vendor_id: 0x1532,
                product_id: 0x0529,
                bus_number: 1,
                address: 2,
                product: None,
                serial_number: None,
            },
            Transport::Usb,
        )
    }

    fn allocator() -> Arc<dyn Allocator> {
        Arc::new(SystemAllocator::new())
    }

    fn state_setup(allocator: &Arc<dyn Allocator>) -> DmaBuf {
        DmaBuf::copy_from(allocator, "setup", &protocol::STATE_REQUEST.to_bytes()).unwrap()
    }

    fn binding(
        allocator: &Arc<dyn Allocator>,
        complete: CompleteFn,
        context: BusDevice,
    ) -> ControlUrb {
        let setup = state_setup(allocator);
        let data = DmaBuf::copy_from(allocator, "data", &protocol::STATE_PAYLOAD).unwrap();
        ControlUrb::new(Arc::new(OkPipe), setup, data, complete, context)
    }

    static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);

    fn count_completion(completion: &Completion<'_>) {
        assert!(completion.status.is_success());
        assert_eq!(completion.actual_length, 1);
        COMPLETIONS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_submit_completes_and_returns_to_idle() {
        let allocator = allocator();
        let urb = Urb::alloc(&allocator, "urb").unwrap();
        let before = COMPLETIONS.load(Ordering::SeqCst);

        urb.submit(binding(&allocator, count_completion, device()))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !urb.is_idle() {
            assert!(std::time::Instant::now() < deadline, "transfer never completed");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(urb.is_idle());
        assert_eq!(urb.submitted(), 1);
        assert!(COMPLETIONS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_rejects_mismatched_payload() {
        let allocator = allocator();
        let urb = Urb::alloc(&allocator, "urb").unwrap();

        let setup = state_setup(&allocator);
        let data = DmaBuf::copy_from(&allocator, "data", &protocol::VOLUME_PAYLOAD).unwrap();
        let result = urb.submit(ControlUrb::new(
            Arc::new(OkPipe),
            setup,
            data,
            count_completion,
            device(),
        ));

        assert!(matches!(result, Err(BusError::InvalidRequest(_))));
        assert_eq!(urb.submitted(), 0);
    }

    struct RefusingPipe;

    impl ControlPipe for RefusingPipe {
        fn accept(&self, _setup: &ControlRequest) -> Result<(), BusError> {
            Err(BusError::NoDevice)
        }

        fn control_out(
            &self,
            _setup: &ControlRequest,
            _data: &[u8],
        ) -> Result<usize, TransferStatus> {
            panic!("refused request reached the pipe");
        }
    }

    #[test]
    fn test_pipe_refusal_queues_nothing() {
        let allocator = allocator();
        let urb = Urb::alloc(&allocator, "urb").unwrap();

        let setup = state_setup(&allocator);
        let data = DmaBuf::copy_from(&allocator, "data", &protocol::STATE_PAYLOAD).unwrap();
        let result = urb.submit(ControlUrb::new(
            Arc::new(RefusingPipe),
            setup,
            data,
            count_completion,
            device(),
        ));

        assert_eq!(result, Err(BusError::NoDevice));
        assert!(urb.is_idle());
        assert_eq!(urb.submitted(), 0);

        // The request is still usable
        urb.submit(binding(&allocator, ignore_completion, device()))
            .unwrap();
        urb.kill();
        assert_eq!(urb.submitted(), 1);
    }

    struct BlockingPipe {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ControlPipe for BlockingPipe {
        fn control_out(
            &self,
            _setup: &ControlRequest,
            data: &[u8],
        ) -> Result<usize, TransferStatus> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(data.len())
        }
    }

    fn ignore_completion(_completion: &Completion<'_>) {}

    #[test]
    fn test_second_submit_is_busy_while_in_flight() {
        let allocator = allocator();
        let urb = Urb::alloc(&allocator, "urb").unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let pipe = Arc::new(BlockingPipe {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });

        let make = |allocator: &Arc<dyn Allocator>| {
            let setup = state_setup(allocator);
            let data = DmaBuf::copy_from(allocator, "data", &protocol::STATE_PAYLOAD).unwrap();
            ControlUrb::new(pipe.clone(), setup, data, ignore_completion, device())
        };

        urb.submit(make(&allocator)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(urb.submit(make(&allocator)), Err(BusError::Busy));

        release_tx.send(()).unwrap();
        urb.kill();
        assert!(urb.is_idle());
        assert_eq!(urb.submitted(), 1);
    }

    struct Chain {
        urb: Urb,
        allocator: Arc<dyn Allocator>,
        hops: AtomicUsize,
        resubmit: Mutex<Option<Result<(), BusError>>>,
    }

    fn resubmit_once(completion: &Completion<'_>) {
        let Some(chain) = completion.context.drvdata::<Chain>() else {
            return;
        };
        if chain.hops.fetch_add(1, Ordering::SeqCst) == 0 {
            let next = binding(&chain.allocator, resubmit_once, completion.context.clone());
            *chain.resubmit.lock().unwrap() = Some(chain.urb.submit(next));
        }
    }

    #[test]
    fn test_resubmit_from_own_completion() {
        let allocator = allocator();
        let chain = Arc::new(Chain {
            urb: Urb::alloc(&allocator, "urb").unwrap(),
            allocator: allocator.clone(),
            hops: AtomicUsize::new(0),
            resubmit: Mutex::new(None),
        });
        let dev = device();
        dev.set_drvdata(chain.clone());

        chain
            .urb
            .submit(binding(&allocator, resubmit_once, dev.clone()))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while chain.hops.load(Ordering::SeqCst) < 2 || !chain.urb.is_idle() {
            assert!(std::time::Instant::now() < deadline, "chain never finished");
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(*chain.resubmit.lock().unwrap(), Some(Ok(())));
        assert_eq!(chain.urb.submitted(), 2);
        drop(dev.take_drvdata::<Chain>());
    }

    struct CountingPipe {
        entered: AtomicUsize,
    }

    impl ControlPipe for CountingPipe {
        fn control_out(
            &self,
            _setup: &ControlRequest,
            data: &[u8],
        ) -> Result<usize, TransferStatus> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            Ok(data.len())
        }
    }

    #[derive(Default)]
    struct Outcomes {
        cancelled: AtomicUsize,
        completed: AtomicUsize,
    }

    fn record_outcome(completion: &Completion<'_>) {
        let Some(outcomes) = completion.context.drvdata::<Outcomes>() else {
            return;
        };
        match completion.status {
            TransferStatus::Cancelled => outcomes.cancelled.fetch_add(1, Ordering::SeqCst),
            _ => outcomes.completed.fetch_add(1, Ordering::SeqCst),
        };
    }

    #[test]
    fn test_kill_cancels_transfer_not_yet_started() {
        let allocator = allocator();

        for _ in 0..50 {
            let urb = Urb::alloc(&allocator, "urb").unwrap();
            let pipe = Arc::new(CountingPipe {
                entered: AtomicUsize::new(0),
            });
            let outcomes = Arc::new(Outcomes::default());
            let dev = device();
            dev.set_drvdata(outcomes.clone());

            let setup = state_setup(&allocator);
            let data = DmaBuf::copy_from(&allocator, "data", &protocol::STATE_PAYLOAD).unwrap();
            urb.submit(ControlUrb::new(pipe.clone(), setup, data, record_outcome, dev.clone()))
                .unwrap();
            urb.kill();

            // Exactly one completion, and the pipe only ran if it was not cancelled
            assert!(urb.is_idle());
            let cancelled = outcomes.cancelled.load(Ordering::SeqCst);
            let completed = outcomes.completed.load(Ordering::SeqCst);
            assert_eq!(cancelled + completed, 1);
            assert_eq!(pipe.entered.load(Ordering::SeqCst), completed);

            // Rejection is lifted once the kill returns
            assert!(!urb.is_cancelling());
        }
    }
}
