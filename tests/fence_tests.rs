//! Fence Timeline Tests
//!
//! Tests for:
//! - FenceTimeline: value assignment, completion queries, completion cache
//! - wait_until: bounded timeouts, unbounded waits, device loss, unsignaled values
//! - Misuse: non-monotonic signals

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cadence::cadence_headless::HeadlessDevice;
use cadence::{CadenceError, ErrorKind, FenceTimeline};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manual_timeline() -> (Arc<HeadlessDevice>, FenceTimeline<HeadlessDevice>) {
    init_logger();
    let device = Arc::new(HeadlessDevice::manual());
    let timeline = FenceTimeline::new(Arc::clone(&device)).unwrap();
    (device, timeline)
}

// ============================================================================
// Signaling
// ============================================================================

#[test]
fn new_timeline_starts_at_zero() {
    let (_device, timeline) = manual_timeline();
    assert_eq!(timeline.last_signaled(), 0);
    assert_eq!(timeline.completed_value(), 0);
    assert_eq!(timeline.next_value(), 1);
}

#[test]
fn value_zero_is_always_complete() {
    let (_device, timeline) = manual_timeline();
    assert!(timeline.is_complete(0));
    timeline.wait_until(0, None).unwrap();
}

#[test]
fn signal_next_assigns_consecutive_values() {
    let (_device, timeline) = manual_timeline();
    assert_eq!(timeline.signal_next().unwrap(), 1);
    assert_eq!(timeline.signal_next().unwrap(), 2);
    assert_eq!(timeline.signal_next().unwrap(), 3);
    assert_eq!(timeline.last_signaled(), 3);
    assert_eq!(timeline.next_value(), 4);
}

#[test]
fn signaled_values_complete_only_when_the_queue_runs() {
    let (device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();
    timeline.signal_next().unwrap();
    assert!(!timeline.is_complete(1));

    device.complete_through(1);
    assert!(timeline.is_complete(1));
    assert!(!timeline.is_complete(2));

    device.flush();
    assert_eq!(timeline.completed_value(), 2);
}

#[test]
fn immediate_device_completes_during_signal() {
    init_logger();
    let device = Arc::new(HeadlessDevice::immediate());
    let timeline = FenceTimeline::new(device).unwrap();
    let value = timeline.signal_next().unwrap();
    assert!(timeline.is_complete(value));
}

#[test]
fn explicit_signal_may_skip_values() {
    let (device, timeline) = manual_timeline();
    timeline.signal(5).unwrap();
    assert_eq!(timeline.last_signaled(), 5);
    assert_eq!(timeline.next_value(), 6);
    device.flush();
    assert!(timeline.is_complete(3));
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "misuse"))]
fn signal_rejects_non_increasing_values() {
    let (_device, timeline) = manual_timeline();
    timeline.signal(4).unwrap();
    let err = timeline.signal(4).unwrap_err();
    assert_eq!(err, CadenceError::NonMonotonicSignal { value: 4, last: 4 });
    assert_eq!(timeline.last_signaled(), 4);
}

// ============================================================================
// Waiting
// ============================================================================

#[test]
fn bounded_wait_times_out_on_a_stalled_queue() {
    let (device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();

    let err = timeline.wait_until(1, Some(Duration::from_millis(50))).unwrap_err();
    match err {
        CadenceError::Timeout { expected, observed, waited } => {
            assert_eq!(expected, 1);
            assert_eq!(observed, 0);
            assert!(waited >= Duration::from_millis(50));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_recoverable());

    // The caller decides how to proceed; progress afterwards is observed.
    device.flush();
    timeline.wait_until(1, Some(Duration::from_millis(50))).unwrap();
}

#[test]
fn bounded_wait_on_a_value_never_signaled_times_out() {
    let (_device, timeline) = manual_timeline();

    let err = timeline.wait_until(100, Some(Duration::from_millis(30))).unwrap_err();
    assert!(
        matches!(err, CadenceError::Timeout { expected: 100, observed: 0, .. }),
        "expected a timeout, got {err:?}"
    );
    assert!(!err.is_fatal());
    assert_eq!(timeline.last_signaled(), 0);
}

#[test]
fn unbounded_wait_returns_when_another_thread_makes_progress() {
    let (device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();

    let worker = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.flush();
        })
    };
    timeline.wait_until(1, None).unwrap();
    assert!(timeline.is_complete(1));
    worker.join().unwrap();
}

#[test]
fn unbounded_wait_on_an_unsignaled_value_is_refused() {
    let (_device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();

    let err = timeline.wait_until(7, None).unwrap_err();
    assert_eq!(err, CadenceError::UnsignaledWait { expected: 7, last_signaled: 1 });
    assert_eq!(err.kind(), ErrorKind::Misuse);
}

#[test]
fn threaded_device_completes_in_order() {
    init_logger();
    let device = Arc::new(
        HeadlessDevice::new(cadence::cadence_headless::ExecutionMode::Threaded {
            latency: Duration::from_millis(1),
        })
        .unwrap(),
    );
    let timeline = FenceTimeline::new(device).unwrap();
    for _ in 0..10 {
        timeline.signal_next().unwrap();
    }
    timeline.wait_until(10, None).unwrap();
    assert_eq!(timeline.completed_value(), 10);
}

// ============================================================================
// Device Loss
// ============================================================================

#[test]
fn wait_reports_device_loss_instead_of_timing_out() {
    let (device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();
    device.lose("driver reset");

    let err = timeline.wait_until(1, Some(Duration::from_millis(50))).unwrap_err();
    match &err {
        CadenceError::DeviceLost { reason, expected, observed } => {
            assert_eq!(reason, "driver reset");
            assert_eq!(*expected, Some(1));
            assert_eq!(*observed, 0);
        }
        other => panic!("expected device loss, got {other:?}"),
    }
    assert!(err.is_fatal());
    assert!(!err.is_recoverable());
}

#[test]
fn loss_wakes_a_blocked_waiter() {
    let (device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();

    let killer = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.lose("hung shader");
        })
    };
    let err = timeline.wait_until(1, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceLost);
    killer.join().unwrap();
}

#[test]
fn signal_on_a_lost_device_fails_without_consuming_a_value() {
    let (device, timeline) = manual_timeline();
    device.lose("removed");
    let err = timeline.signal_next().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(timeline.last_signaled(), 0);
    assert!(timeline.check_device().is_err());
}

#[test]
fn completed_value_never_regresses() {
    let (device, timeline) = manual_timeline();
    timeline.signal_next().unwrap();
    device.flush();
    assert_eq!(timeline.completed_value(), 1);

    // A lost device keeps its last observed value.
    device.lose("removed");
    assert_eq!(timeline.completed_value(), 1);
}
