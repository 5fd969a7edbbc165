//! Detach integration tests
//!
//! Detach must cancel the outstanding request and wait for its completion
//! handler before anything the request points at is released, whatever
//! point of the handshake it lands on.
//!
//! Run with: `cargo test -p driver --test detach_tests`

use common::hostbus::BusDevice;
use common::test_utils::{
    BusEvent, DEFAULT_TEST_TIMEOUT, MockBus, create_mock_sound_card, wait_until,
};
use driver::sidetone::{ACQUISITION_ORDER, SidetoneDriver, SoundCard};
use protocol::VOLUME_REQUEST;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn setup() -> (Arc<MockBus>, Arc<SidetoneDriver>) {
    let bus = Arc::new(MockBus::new());
    let driver = Arc::new(SidetoneDriver::new(bus.clone()));
    (bus, driver)
}

/// Each resource released exactly once, and nothing reached the pipe after
/// the first release
fn assert_clean_teardown(bus: &MockBus, device: &BusDevice) {
    let journal = bus.journal();
    let key = device.key();

    let mut released = journal.released();
    let mut acquired = journal.acquired();
    released.sort_unstable();
    acquired.sort_unstable();
    assert_eq!(released, acquired);
    assert_eq!(released.len(), ACQUISITION_ORDER.len());
    assert!(bus.mock_allocator().live().is_empty());

    let events = journal.snapshot();
    let first_release = events
        .iter()
        .position(|e| matches!(e, BusEvent::Released(_)))
        .expect("resources released");
    assert!(
        !events[first_release..]
            .iter()
            .any(|e| matches!(e, BusEvent::TransferStarted { .. })),
        "transfer started after teardown began"
    );

    let stopped = journal
        .position(|e| *e == BusEvent::ChannelStopped(key))
        .expect("channel stopped");
    let last_release = events
        .iter()
        .rposition(|e| matches!(e, BusEvent::Released(_)))
        .unwrap();
    assert!(last_release < stopped);
    assert!(!bus.channel_running(device));
}

// ============================================================================
// Detach After Handshake
// ============================================================================

#[test]
fn test_detach_releases_in_reverse_order() {
    let (bus, driver) = setup();
    let device = create_mock_sound_card(4);

    driver.attach(&device).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        driver
            .handshake_state(&device)
            .is_some_and(|s| s.is_terminal())
    }));

    driver.detach(&device);

    let mut expected = ACQUISITION_ORDER.to_vec();
    expected.reverse();
    assert_eq!(bus.journal().released(), expected);
    assert!(!device.has_drvdata());
    assert_clean_teardown(&bus, &device);
}

#[test]
fn test_detach_without_context_is_noop() {
    let (bus, driver) = setup();
    let device = create_mock_sound_card(4);

    driver.detach(&device);
    assert!(bus.journal().snapshot().is_empty());
}

// ============================================================================
// Detach During Flight
// ============================================================================

#[test]
fn test_detach_blocks_until_callback_returns() {
    let (bus, driver) = setup();
    let device = create_mock_sound_card(4);
    let pipe = bus.pipe(&device);
    pipe.hold();

    driver.attach(&device).unwrap();
    assert!(pipe.wait_entered(1, DEFAULT_TEST_TIMEOUT));

    let card = device.drvdata::<SoundCard>().unwrap();
    let detacher = {
        let driver = driver.clone();
        let device = device.clone();
        thread::spawn(move || driver.detach(&device))
    };
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || card.urb().is_cancelling()));
    drop(card);

    // Cancel is waiting on the transfer; nothing may be released yet
    thread::sleep(Duration::from_millis(20));
    assert!(!detacher.is_finished());
    assert!(bus.journal().released().is_empty());

    pipe.open();
    detacher.join().unwrap();

    let journal = bus.journal();
    let volume_done = journal
        .position(
            |e| matches!(e, BusEvent::TransferFinished { setup, .. } if *setup == VOLUME_REQUEST),
        )
        .unwrap();
    let first_release = journal
        .position(|e| matches!(e, BusEvent::Released(_)))
        .unwrap();
    assert!(volume_done < first_release);

    // Resubmission was refused while cancelling
    assert_eq!(journal.transfers(), vec![VOLUME_REQUEST]);
    assert_clean_teardown(&bus, &device);
}

#[test]
fn test_detach_at_random_points() {
    let mut rng = rand::rng();

    for round in 0..50u8 {
        let (bus, driver) = setup();
        let device = create_mock_sound_card(round);

        driver.attach(&device).unwrap();

        if rng.random_bool(0.5) {
            thread::sleep(Duration::from_micros(rng.random_range(0..2000)));
        } else {
            for _ in 0..rng.random_range(0..200) {
                thread::yield_now();
            }
        }

        driver.detach(&device);

        assert!(!device.has_drvdata(), "round {}", round);
        assert_clean_teardown(&bus, &device);
    }
}

#[test]
fn test_detach_with_gate_opened_at_random() {
    let mut rng = rand::rng();

    for round in 0..20u8 {
        let (bus, driver) = setup();
        let device = create_mock_sound_card(round);
        let pipe = bus.pipe(&device);
        pipe.hold();

        driver.attach(&device).unwrap();
        assert!(pipe.wait_entered(1, DEFAULT_TEST_TIMEOUT));

        let delay = Duration::from_micros(rng.random_range(0..3000));
        let opener = {
            let pipe = pipe.clone();
            thread::spawn(move || {
                thread::sleep(delay);
                pipe.open();
            })
        };

        driver.detach(&device);
        opener.join().unwrap();

        assert_clean_teardown(&bus, &device);
    }
}
