//! Submission Tracker Tests
//!
//! Tests for:
//! - Fence assignment at submit time
//! - Pool allocators released under the fence of the submission using them
//! - Frame allocators handed back instead of pooled
//! - Retirement across every registered reclaimer
//! - Drain after the device goes idle

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use cadence::cadence_headless::{ExecutionMode, HeadlessDevice};
use cadence::{
    FenceTimeline, FenceValue, FramePacer, Graveyard, Reclaim, ResourceFactory, ResourcePool, SubmissionTracker,
};

struct Setup {
    device: Arc<HeadlessDevice>,
    timeline: Arc<FenceTimeline<HeadlessDevice>>,
    allocators: Arc<ResourcePool<<HeadlessDevice as ResourceFactory>::CommandAllocator>>,
    graveyard: Arc<Graveyard>,
    tracker: SubmissionTracker<HeadlessDevice>,
}

fn setup(device: HeadlessDevice) -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(device);
    let timeline = Arc::new(FenceTimeline::new(Arc::clone(&device)).unwrap());
    let allocators = Arc::new(ResourcePool::new("command allocators", 8));
    let graveyard = Arc::new(Graveyard::new());
    let tracker = SubmissionTracker::new(
        Arc::clone(&device),
        Arc::clone(&timeline),
        Arc::clone(&allocators),
        Arc::clone(&graveyard),
    );
    Setup { device, timeline, allocators, graveyard, tracker }
}

#[derive(Default)]
struct Probe {
    last_completed: AtomicU64,
    calls: AtomicUsize,
    drained: AtomicUsize,
}

impl Reclaim for Probe {
    fn label(&self) -> &'static str {
        "probe"
    }

    fn reclaim_completed(&self, completed: FenceValue) -> usize {
        self.last_completed.store(completed, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn drain_all(&self) -> usize {
        self.drained.fetch_add(1, Ordering::SeqCst);
        0
    }
}

// ============================================================================
// Submission
// ============================================================================

#[test]
fn submissions_signal_consecutive_fence_values() {
    let mut s = setup(HeadlessDevice::manual());
    let first = s.tracker.begin().unwrap();
    let second = s.tracker.begin().unwrap();

    assert_eq!(s.tracker.submit(first, false).unwrap().fence, 1);
    assert_eq!(s.tracker.submit(second, false).unwrap().fence, 2);
    assert_eq!(s.tracker.submissions(), 2);
    assert_eq!(s.timeline.last_signaled(), 2);
    assert_eq!(s.timeline.completed_value(), 0);
    s.device.flush();
}

#[test]
fn pool_allocator_stays_pending_until_its_fence_completes() {
    let mut s = setup(HeadlessDevice::manual());
    let mut recording = s.tracker.begin().unwrap();
    recording.list_mut().marker(7);
    let outcome = s.tracker.submit(recording, false).unwrap();
    assert!(outcome.frame_allocator.is_none());

    let stats = s.allocators.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.in_use, 0);

    assert_eq!(s.tracker.retire(), 0);
    assert_eq!(s.allocators.stats().pending, 1);

    s.device.flush();
    assert_eq!(s.tracker.retire(), 1);
    let stats = s.allocators.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.available, 1);
    assert_eq!(s.device.markers(), vec![7]);
}

#[test]
fn reclaimed_allocator_is_reused_for_the_next_recording() {
    let mut s = setup(HeadlessDevice::immediate());
    for _ in 0..4 {
        let recording = s.tracker.begin().unwrap();
        s.tracker.submit(recording, false).unwrap();
        s.tracker.retire();
    }
    let stats = s.allocators.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.hits, 3);
    assert_eq!(s.device.allocators_created(), 1);
}

#[test]
fn waiting_submit_returns_after_completion() {
    let mut s = setup(HeadlessDevice::new(ExecutionMode::Threaded { latency: Duration::from_millis(5) }).unwrap());
    let recording = s.tracker.begin().unwrap();
    let outcome = s.tracker.submit(recording, true).unwrap();

    assert!(s.timeline.is_complete(outcome.fence));
    assert_eq!(s.allocators.stats().available, 1);
}

#[test]
fn frame_allocator_is_handed_back_to_its_slot() {
    let mut s = setup(HeadlessDevice::immediate());
    let mut pacer: FramePacer<<HeadlessDevice as ResourceFactory>::CommandAllocator> = FramePacer::new(2, Duration::from_secs(5));
    let slot = pacer.begin_frame(&*s.timeline).unwrap();

    let allocator = s.device.create_command_allocator().unwrap();
    let recording = s.tracker.begin_with(slot, allocator).unwrap();
    assert_eq!(recording.frame(), Some(slot));

    let outcome = s.tracker.submit(recording, false).unwrap();
    let (returned_slot, _allocator) = outcome.frame_allocator.unwrap();
    assert_eq!(returned_slot, slot);
    assert_eq!(s.allocators.stats().created, 0);
}

#[test]
fn abandoned_recording_returns_its_allocator() {
    let s = setup(HeadlessDevice::immediate());
    let recording = s.tracker.begin().unwrap();
    assert_eq!(s.tracker.abandon(recording).unwrap().map(|(slot, _)| slot), None);

    assert_eq!(s.tracker.retire(), 1);
    assert_eq!(s.allocators.stats().available, 1);
    assert_eq!(s.tracker.submissions(), 0);
}

// ============================================================================
// Retirement
// ============================================================================

#[test]
fn retire_queries_completion_once_for_every_reclaimer() {
    let mut s = setup(HeadlessDevice::manual());
    let probe = Arc::new(Probe::default());
    s.tracker.register(probe.clone());

    let recording = s.tracker.begin().unwrap();
    s.tracker.submit(recording, false).unwrap();
    s.graveyard.bury(1, vec![0_u8; 64]);

    s.tracker.retire();
    assert_eq!(probe.last_completed.load(Ordering::SeqCst), 0);
    assert_eq!(s.graveyard.len(), 1);

    s.device.flush();
    assert_eq!(s.tracker.retire(), 2);
    assert_eq!(probe.last_completed.load(Ordering::SeqCst), 1);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    assert!(s.graveyard.is_empty());
}

#[test]
fn drain_waits_for_the_device_and_releases_everything() {
    let mut s = setup(HeadlessDevice::new(ExecutionMode::Threaded { latency: Duration::from_millis(2) }).unwrap());
    let probe = Arc::new(Probe::default());
    s.tracker.register(probe.clone());

    for _ in 0..3 {
        let recording = s.tracker.begin().unwrap();
        s.tracker.submit(recording, false).unwrap();
    }
    s.graveyard.bury(s.timeline.last_signaled(), String::from("scratch"));

    let released = s.tracker.drain().unwrap();
    assert!(s.timeline.is_complete(3));
    assert!(released >= 2);
    assert_eq!(s.allocators.stats().live, 0);
    assert!(s.graveyard.is_empty());
    assert_eq!(probe.drained.load(Ordering::SeqCst), 1);
}

#[test]
fn drain_proceeds_after_device_loss() {
    let mut s = setup(HeadlessDevice::manual());
    let recording = s.tracker.begin().unwrap();
    s.tracker.submit(recording, false).unwrap();

    s.device.lose("test");
    s.tracker.drain().unwrap();
    assert_eq!(s.allocators.stats().live, 0);
}
