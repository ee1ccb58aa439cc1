//! Frame Pacer
//!
//! Bounds how far the CPU may run ahead of the GPU. Each of the N frame
//! slots owns a primary command allocator and a list of transient resources;
//! a slot is reused only after the highest fence value submitted from it has
//! completed.
//!
//! ```text
//!   Idle ──begin_frame──► Recording ──end_frame──► Submitted
//!    ▲                                                 │
//!    └──────────── fence of the slot completes ◄───────┘
//!
//!   Idle ──drain──► Destroyed
//! ```
//!
//! `begin_frame` is the only operation expected to block routinely.

use std::any::Any;
use std::time::{Duration, Instant};

use cadence_core::errors::{CadenceError, Result, misuse};
use cadence_core::{CommandQueue, FenceTimeline, FenceValue, Poolable};
use smallvec::SmallVec;

/// Identifies one frame: the slot it occupies and its frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSlot {
    index: u32,
    frame: u64,
}

impl FrameSlot {
    /// Slot index in `0..N`.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Frame number, starting at 1.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
    Destroyed,
}

impl SlotState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Submitted => "submitted",
            Self::Destroyed => "destroyed",
        }
    }
}

struct FrameContext<A> {
    state: SlotState,
    frame: u64,
    /// Highest fence value submitted from this slot.
    fence: FenceValue,
    allocator: Option<A>,
    checked_out: bool,
    transient: Vec<Box<dyn Any + Send>>,
    submissions: SmallVec<[FenceValue; 4]>,
}

impl<A> FrameContext<A> {
    fn new() -> Self {
        Self {
            state: SlotState::Idle,
            frame: 0,
            fence: 0,
            allocator: None,
            checked_out: false,
            transient: Vec::new(),
            submissions: SmallVec::new(),
        }
    }
}

/// Frames-per-second estimate, refreshed once per second of ended frames.
struct FrameRate {
    last_update: Instant,
    frame_count: u32,
    accumulated: Duration,
    current: f32,
}

impl FrameRate {
    fn new() -> Self {
        Self { last_update: Instant::now(), frame_count: 0, accumulated: Duration::ZERO, current: 0.0 }
    }

    fn update(&mut self) {
        self.frame_count += 1;
        let now = Instant::now();
        self.accumulated += now - self.last_update;
        self.last_update = now;

        if self.accumulated.as_secs_f32() >= 1.0 {
            self.current = self.frame_count as f32 / self.accumulated.as_secs_f32();
            self.accumulated = Duration::ZERO;
            self.frame_count = 0;
        }
    }
}

/// Snapshot of pacing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacerStats {
    pub frames_in_flight: u32,
    pub frames_begun: u64,
    /// `begin_frame` calls that waited on the in-flight bound.
    pub backpressure_waits: u64,
    /// `begin_frame` calls that waited on the slot's own fence.
    pub slot_waits: u64,
    /// Slot waits that exceeded the bounded wait and fell back to an
    /// unbounded one.
    pub escalated_waits: u64,
    pub implicit_closes: u64,
    pub time_blocked: Duration,
    pub frame_rate: f32,
}

/// Ring of N frame slots.
pub struct FramePacer<A> {
    frames: Vec<FrameContext<A>>,
    current: usize,
    frame_number: u64,
    bounded_wait: Duration,
    rate: FrameRate,
    stats: PacerStats,
}

impl<A: Poolable> FramePacer<A> {
    #[must_use]
    pub fn new(frames_in_flight: u32, bounded_wait: Duration) -> Self {
        let n = frames_in_flight.max(1);
        Self {
            frames: (0..n).map(|_| FrameContext::new()).collect(),
            current: n as usize - 1,
            frame_number: 0,
            bounded_wait,
            rate: FrameRate::new(),
            stats: PacerStats { frames_in_flight: n, ..PacerStats::default() },
        }
    }

    #[inline]
    #[must_use]
    pub fn frames_in_flight(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Starts the next frame, blocking until its slot may be reused.
    ///
    /// A frame still recording in the current slot is closed implicitly.
    /// The CPU is kept at most N-1 frames ahead of the last completed fence
    /// value. The slot's own fence is awaited with a bounded wait first and
    /// an unbounded one after it; if that fails the pacer does not advance.
    pub fn begin_frame<Q: CommandQueue>(&mut self, timeline: &FenceTimeline<Q>) -> Result<FrameSlot> {
        let n = self.frames.len();
        {
            let ctx = &mut self.frames[self.current];
            match ctx.state {
                SlotState::Recording => {
                    log::warn!(
                        "frame {} (slot {}) was never ended; closing it implicitly",
                        ctx.frame,
                        self.current
                    );
                    ctx.state = SlotState::Submitted;
                    self.stats.implicit_closes += 1;
                }
                SlotState::Destroyed => {
                    return Err(misuse(CadenceError::FrameState {
                        slot: self.current as u32,
                        expected: SlotState::Idle.name(),
                        found: SlotState::Destroyed.name(),
                    }));
                }
                SlotState::Idle | SlotState::Submitted => {}
            }
        }

        let next = (self.current + 1) % n;
        let start = Instant::now();

        let signaled = timeline.last_signaled();
        let window = n as FenceValue - 1;
        if signaled > window {
            let bound = signaled - window;
            if !timeline.is_complete(bound) {
                self.stats.backpressure_waits += 1;
                log::trace!("frame pacing: waiting for fence {bound} ({signaled} signaled)");
                timeline.wait_until(bound, None)?;
            }
        }

        let slot_fence = self.frames[next].fence;
        if !timeline.is_complete(slot_fence) {
            self.stats.slot_waits += 1;
            match timeline.wait_until(slot_fence, Some(self.bounded_wait)) {
                Ok(()) => {}
                Err(CadenceError::Timeout { observed, waited, .. }) => {
                    self.stats.escalated_waits += 1;
                    log::warn!(
                        "slot {next} still busy after {waited:?} (fence {slot_fence}, completed {observed}); waiting without bound"
                    );
                    timeline.wait_until(slot_fence, None)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.stats.time_blocked += start.elapsed();

        let ctx = &mut self.frames[next];
        if !timeline.is_complete(ctx.fence) {
            return Err(misuse(CadenceError::FrameState {
                slot: next as u32,
                expected: SlotState::Idle.name(),
                found: ctx.state.name(),
            }));
        }
        if ctx.checked_out {
            log::warn!(
                "slot {next}: primary allocator from frame {} was never returned; replacing it",
                ctx.frame
            );
            ctx.checked_out = false;
        }
        if let Some(allocator) = ctx.allocator.as_mut() {
            allocator.reset()?;
        }
        ctx.transient.clear();
        ctx.submissions.clear();

        self.frame_number += 1;
        ctx.state = SlotState::Recording;
        ctx.frame = self.frame_number;
        self.current = next;
        self.stats.frames_begun += 1;

        log::trace!("begin frame {} in slot {next}", self.frame_number);
        Ok(FrameSlot { index: next as u32, frame: self.frame_number })
    }

    /// The frame currently recording, if any.
    #[must_use]
    pub fn current_slot(&self) -> Option<FrameSlot> {
        let ctx = &self.frames[self.current];
        (ctx.state == SlotState::Recording)
            .then_some(FrameSlot { index: self.current as u32, frame: ctx.frame })
    }

    #[must_use]
    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.frames.get(index as usize).map(|ctx| ctx.state)
    }

    /// Highest fence value tied to slot `index`.
    #[must_use]
    pub fn slot_fence(&self, index: u32) -> Option<FenceValue> {
        self.frames.get(index as usize).map(|ctx| ctx.fence)
    }

    /// Submissions recorded in the slot's current frame.
    #[must_use]
    pub fn slot_submissions(&self, index: u32) -> &[FenceValue] {
        self.frames.get(index as usize).map(|ctx| ctx.submissions.as_slice()).unwrap_or_default()
    }

    /// Ties `fence` to the recording frame `slot`.
    pub fn record_submission(&mut self, slot: FrameSlot, fence: FenceValue) -> Result<()> {
        let ctx = self.recording(slot)?;
        ctx.fence = ctx.fence.max(fence);
        ctx.submissions.push(fence);
        Ok(())
    }

    /// Closes the frame. `fence` covers all of the frame's work.
    pub fn end_frame(&mut self, slot: FrameSlot, fence: FenceValue) -> Result<()> {
        let ctx = self.recording(slot)?;
        ctx.fence = ctx.fence.max(fence);
        ctx.state = SlotState::Submitted;
        self.rate.update();
        log::trace!("end frame {} at fence {fence}", slot.frame);
        Ok(())
    }

    /// Marks submitted slots whose fence has completed as idle.
    pub fn refresh(&mut self, completed: FenceValue) {
        for ctx in &mut self.frames {
            if ctx.state == SlotState::Submitted && ctx.fence <= completed {
                ctx.state = SlotState::Idle;
            }
        }
    }

    #[must_use]
    pub fn has_allocator(&self, slot: FrameSlot) -> bool {
        self.frames
            .get(slot.index as usize)
            .is_some_and(|ctx| ctx.frame == slot.frame && ctx.allocator.is_some())
    }

    /// `true` while the slot's primary allocator is lent to a recording.
    #[must_use]
    pub fn is_lent(&self, slot: FrameSlot) -> bool {
        self.frames
            .get(slot.index as usize)
            .is_some_and(|ctx| ctx.frame == slot.frame && ctx.checked_out)
    }

    /// Fails unless `slot` is the frame currently recording.
    pub fn check_recording(&mut self, slot: FrameSlot) -> Result<()> {
        self.recording(slot).map(|_| ())
    }

    /// Lends the slot's primary allocator, if it is parked in the slot.
    pub fn take_allocator(&mut self, slot: FrameSlot) -> Option<A> {
        let ctx = self.frames.get_mut(slot.index as usize)?;
        if ctx.state != SlotState::Recording || ctx.frame != slot.frame || ctx.checked_out {
            return None;
        }
        let allocator = ctx.allocator.take()?;
        ctx.checked_out = true;
        Some(allocator)
    }

    /// Parks a freshly created primary allocator in the slot.
    pub fn install_allocator(&mut self, slot: FrameSlot, allocator: A) -> Result<()> {
        let ctx = self.recording(slot)?;
        if ctx.allocator.is_some() || ctx.checked_out {
            return Err(misuse(CadenceError::FrameState {
                slot: slot.index,
                expected: "without a primary allocator",
                found: "holding one",
            }));
        }
        ctx.allocator = Some(allocator);
        Ok(())
    }

    /// Gives a lent allocator back to its slot once the list recorded into
    /// it was submitted at `fence`. Fails, handing the allocator back, when
    /// the slot has since moved on to another frame.
    pub fn return_allocator(
        &mut self,
        slot: FrameSlot,
        allocator: A,
        fence: FenceValue,
    ) -> std::result::Result<(), A> {
        match self.frames.get_mut(slot.index as usize) {
            Some(ctx) if ctx.frame == slot.frame && ctx.checked_out && ctx.allocator.is_none() => {
                ctx.allocator = Some(allocator);
                ctx.checked_out = false;
                ctx.fence = ctx.fence.max(fence);
                Ok(())
            }
            _ => Err(allocator),
        }
    }

    /// Keeps `resource` alive until the slot is next reused.
    pub fn retain(&mut self, slot: FrameSlot, resource: Box<dyn Any + Send>) -> Result<()> {
        self.recording(slot)?.transient.push(resource);
        Ok(())
    }

    /// Destroys every slot's allocator and transient resources. The caller
    /// guarantees the GPU is idle. Returns the number of objects released.
    pub fn drain(&mut self) -> usize {
        let mut released = 0;
        for (index, ctx) in self.frames.iter_mut().enumerate() {
            if ctx.state == SlotState::Destroyed {
                continue;
            }
            if ctx.state == SlotState::Recording {
                log::warn!("slot {index}: frame {} still recording at drain", ctx.frame);
            }
            released += usize::from(ctx.allocator.take().is_some()) + ctx.transient.len();
            ctx.transient.clear();
            ctx.submissions.clear();
            ctx.state = SlotState::Destroyed;
        }
        released
    }

    #[must_use]
    pub fn stats(&self) -> PacerStats {
        PacerStats { frame_rate: self.rate.current, ..self.stats }
    }

    fn recording(&mut self, slot: FrameSlot) -> Result<&mut FrameContext<A>> {
        let index = slot.index as usize;
        let found = match self.frames.get(index) {
            Some(ctx) if ctx.state == SlotState::Recording && ctx.frame == slot.frame => None,
            Some(ctx) if ctx.state == SlotState::Recording => Some("recording another frame"),
            Some(ctx) => Some(ctx.state.name()),
            None => Some("out of range"),
        };
        if let Some(found) = found {
            return Err(misuse(CadenceError::FrameState {
                slot: slot.index,
                expected: SlotState::Recording.name(),
                found,
            }));
        }
        Ok(&mut self.frames[index])
    }
}

impl<A> std::fmt::Debug for FramePacer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePacer")
            .field("frames_in_flight", &self.frames.len())
            .field("current", &self.current)
            .field("frame_number", &self.frame_number)
            .finish_non_exhaustive()
    }
}
