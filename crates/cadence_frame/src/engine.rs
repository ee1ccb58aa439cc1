//! Engine Core Module
//!
//! This module contains [`Engine`], the per-queue owner of every Cadence
//! component. One engine drives one device queue from one thread; independent
//! queues get independent engines with their own timeline, pacer and pools.
//!
//! # Architecture
//!
//! - **FenceTimeline**: the only source of truth for GPU completion
//! - **FramePacer**: bounds frames in flight, owns per-frame allocators
//! - **SubmissionTracker**: assigns fence values and drives retirement
//! - **StagingRouter**: upload ring plus dedicated staging buffers
//! - **Graveyard**: deferred destruction of arbitrary resources
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence::prelude::*;
//!
//! let mut engine = Engine::new(device, EngineSettings::default())?;
//!
//! loop {
//!     let frame = engine.begin_frame()?;
//!
//!     let mut upload = engine.allocate_upload(4096, 256)?;
//!     upload.write(0, &vertices)?;
//!
//!     let mut recording = engine.acquire_command_allocator()?;
//!     recording.list_mut().copy(upload.device_address(), vertex_buffer, 4096);
//!     engine.submit(recording, false)?;
//!     engine.free_upload(upload)?;
//!
//!     engine.end_frame(frame)?;
//! }
//! ```
//!
//! # Device loss
//!
//! The first [`CadenceError::DeviceLost`] an engine observes is latched:
//! every later operation fails with the same error, and [`Engine::shutdown`]
//! still releases all memory.

use std::any::Any;
use std::sync::Arc;

use cadence_alloc::{Graveyard, ReadbackAllocation, ResourcePool, StagingRouter, UploadAllocation};
use cadence_core::errors::{CadenceError, Result, misuse};
use cadence_core::{Backend, EngineSettings, FenceTimeline, FenceValue, ResourceFactory};

use crate::diagnostics::EngineDiagnostics;
use crate::pacer::{FramePacer, FrameSlot, SlotState};
use crate::submission::{Recording, SubmissionTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineStatus {
    Running,
    Halted(CadenceError),
    ShutDown,
}

/// Command submission and resource lifecycle for one device queue.
pub struct Engine<B: Backend> {
    settings: EngineSettings,
    backend: Arc<B>,
    timeline: Arc<FenceTimeline<B>>,
    allocators: Arc<ResourcePool<<B as ResourceFactory>::CommandAllocator>>,
    staging: Arc<StagingRouter<B>>,
    graveyard: Arc<Graveyard>,
    pacer: FramePacer<<B as ResourceFactory>::CommandAllocator>,
    tracker: SubmissionTracker<B>,
    status: EngineStatus,
}

impl<B: Backend> Engine<B> {
    /// Creates the engine's fence, upload ring and empty pools.
    ///
    /// `settings` are validated first; see [`EngineSettings::validate`].
    pub fn new(backend: Arc<B>, settings: EngineSettings) -> Result<Self> {
        let settings = settings.validate();

        let timeline = Arc::new(FenceTimeline::new(Arc::clone(&backend))?);
        let allocators = Arc::new(ResourcePool::new("command allocators", settings.max_command_allocators));
        let staging = Arc::new(StagingRouter::new(Arc::clone(&backend), &settings)?);
        let graveyard = Arc::new(Graveyard::new());

        let mut tracker = SubmissionTracker::new(
            Arc::clone(&backend),
            Arc::clone(&timeline),
            Arc::clone(&allocators),
            Arc::clone(&graveyard),
        );
        tracker.register(staging.clone());

        let pacer = FramePacer::new(settings.max_frames_in_flight, settings.bounded_frame_wait);

        log::info!(
            "engine created: {} frames in flight, {} MiB upload ring, {} allocators max",
            settings.max_frames_in_flight,
            settings.ring_buffer_size / (1024 * 1024),
            settings.max_command_allocators
        );

        Ok(Self {
            settings,
            backend,
            timeline,
            allocators,
            staging,
            graveyard,
            pacer,
            tracker,
            status: EngineStatus::Running,
        })
    }

    /// The validated settings in effect.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    #[must_use]
    pub fn timeline(&self) -> &FenceTimeline<B> {
        &self.timeline
    }

    /// The frame currently recording, if any.
    #[must_use]
    pub fn current_frame(&self) -> Option<FrameSlot> {
        self.pacer.current_slot()
    }

    #[must_use]
    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.pacer.slot_state(index)
    }

    // === Frames ===

    /// Starts a frame, blocking until its slot may be reused.
    ///
    /// A frame still recording is ended first.
    pub fn begin_frame(&mut self) -> Result<FrameSlot> {
        self.check()?;
        if let Some(open) = self.pacer.current_slot() {
            log::warn!("frame {} was not ended before begin_frame; ending it now", open.frame());
            self.end_frame(open)?;
        }

        let begun = self.pacer.begin_frame(&*self.timeline);
        let slot = self.observe(begun)?;
        // The pacer's waits may have completed more work; retire after them.
        self.tracker.retire();
        self.pacer.refresh(self.timeline.completed_value());
        Ok(slot)
    }

    /// Ends `slot` and returns the fence value that covers its work.
    ///
    /// A frame without submissions signals a fence of its own so its slot
    /// still has a value to wait on.
    pub fn end_frame(&mut self, slot: FrameSlot) -> Result<FenceValue> {
        self.check()?;
        self.pacer.check_recording(slot)?;

        let fence = if self.pacer.slot_submissions(slot.index()).is_empty() {
            let signaled = self.timeline.signal_next();
            self.observe(signaled)?
        } else {
            self.timeline.last_signaled()
        };
        self.pacer.end_frame(slot, fence)?;
        Ok(fence)
    }

    // === Uploads ===

    /// Allocates CPU-writable memory for the next submission to read.
    ///
    /// The memory is tagged with the fence value the next `submit` will
    /// signal; it must be consumed by that submission.
    pub fn allocate_upload(&self, size: u64, alignment: u64) -> Result<UploadAllocation<B>> {
        self.check()?;
        self.staging
            .allocate_upload(size, alignment, self.timeline.next_value(), &*self.timeline)
    }

    /// [`Engine::allocate_upload`] with [`EngineSettings::upload_alignment`].
    pub fn allocate_upload_default(&self, size: u64) -> Result<UploadAllocation<B>> {
        self.allocate_upload(size, self.settings.upload_alignment)
    }

    /// Returns upload memory. Dedicated buffers are recycled once both the
    /// allocation's own tag and everything submitted so far have completed.
    pub fn free_upload(&self, allocation: UploadAllocation<B>) -> Result<()> {
        self.staging.free(allocation, self.timeline.last_signaled())
    }

    /// Allocates a dedicated buffer for the GPU to write `size` bytes into.
    pub fn allocate_readback(&self, size: u64) -> Result<ReadbackAllocation<B>> {
        self.check()?;
        self.staging.allocate_readback(size, &*self.timeline)
    }

    pub fn free_readback(&self, allocation: ReadbackAllocation<B>) -> Result<()> {
        self.staging.free_readback(allocation, self.timeline.last_signaled())
    }

    // === Submission ===

    /// Opens a command list. Inside a frame the first recording uses the
    /// frame's primary allocator; others come from the shared pool. The
    /// allocator is released when the submission consuming it completes.
    pub fn acquire_command_allocator(&mut self) -> Result<Recording<B>> {
        self.check()?;
        if let Some(slot) = self.pacer.current_slot() {
            if !self.pacer.has_allocator(slot) && !self.pacer.is_lent(slot) {
                let created = self.backend.create_command_allocator();
                let allocator = self.observe(created)?;
                self.pacer.install_allocator(slot, allocator)?;
            }
            if let Some(allocator) = self.pacer.take_allocator(slot) {
                return self.tracker.begin_with(slot, allocator);
            }
        }
        let begun = self.tracker.begin();
        self.observe(begun)
    }

    /// Executes `recording` and returns the fence value it signals. With
    /// `wait_for_completion`, blocks until the GPU has finished it.
    pub fn submit(&mut self, recording: Recording<B>, wait_for_completion: bool) -> Result<FenceValue> {
        self.check()?;
        let submitted = self.tracker.submit(recording, wait_for_completion);
        let outcome = self.observe(submitted)?;
        let fence = outcome.fence;

        if let Some(slot) = self.pacer.current_slot() {
            self.pacer.record_submission(slot, fence)?;
        }
        if let Some((slot, allocator)) = outcome.frame_allocator
            && let Err(stray) = self.pacer.return_allocator(slot, allocator, fence)
        {
            log::debug!("frame {} already moved on; retiring its allocator at fence {fence}", slot.frame());
            self.graveyard.bury(fence, stray);
        }
        Ok(fence)
    }

    /// Drops a recording without executing it.
    pub fn abandon(&mut self, recording: Recording<B>) -> Result<()> {
        if let Some((slot, allocator)) = self.tracker.abandon(recording)? {
            let fence = self.timeline.last_signaled();
            if let Err(stray) = self.pacer.return_allocator(slot, allocator, fence) {
                self.graveyard.bury(fence, stray);
            }
        }
        Ok(())
    }

    // === Resource lifetime ===

    /// Destroys `resource` once all work submitted so far, and the next
    /// submission, has completed.
    pub fn defer_release<R: Any + Send>(&self, resource: R) {
        self.graveyard.bury(self.timeline.next_value(), resource);
    }

    /// Keeps `resource` alive until the current frame's slot is reused.
    pub fn retain_for_frame<R: Any + Send>(&mut self, resource: R) -> Result<()> {
        let Some(slot) = self.pacer.current_slot() else {
            return Err(misuse(CadenceError::FrameState {
                slot: 0,
                expected: SlotState::Recording.name(),
                found: "no frame",
            }));
        };
        self.pacer.retain(slot, Box::new(resource))
    }

    /// Queries completion once and retires everything it allows.
    pub fn poll(&mut self) -> Result<usize> {
        self.check()?;
        let device = self.timeline.check_device();
        self.observe(device)?;
        let retired = self.tracker.retire();
        self.pacer.refresh(self.timeline.completed_value());
        Ok(retired)
    }

    /// Blocks until every submitted fence value has completed.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.check()?;
        let last = self.timeline.last_signaled();
        let waited = self.timeline.wait_until(last, None);
        self.observe(waited)?;
        self.tracker.retire();
        self.pacer.refresh(self.timeline.completed_value());
        Ok(())
    }

    /// Waits for the GPU to go idle, then releases every pooled, pending and
    /// deferred resource. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.status == EngineStatus::ShutDown {
            return Ok(());
        }
        if self.status == EngineStatus::Running
            && let Some(open) = self.pacer.current_slot()
            && let Err(e) = self.end_frame(open)
        {
            log::warn!("could not end frame {} during shutdown: {e}", open.frame());
        }

        let diagnostics = self.diagnostics();
        let released = self.tracker.drain()? + self.pacer.drain();
        self.status = EngineStatus::ShutDown;

        log::info!("engine shut down, released {released} resources");
        log::debug!("final state:\n{diagnostics}");
        Ok(())
    }

    /// Read-only counters.
    #[must_use]
    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            last_signaled: self.timeline.last_signaled(),
            completed: self.timeline.completed_value(),
            submissions: self.tracker.submissions(),
            command_allocators: self.allocators.stats(),
            staging: self.staging.stats(),
            frames: self.pacer.stats(),
            deferred_releases: self.graveyard.len(),
            halted: matches!(self.status, EngineStatus::Halted(_)),
        }
    }

    // === Internal ===

    fn check(&self) -> Result<()> {
        match &self.status {
            EngineStatus::Running => Ok(()),
            EngineStatus::Halted(err) => Err(err.clone()),
            EngineStatus::ShutDown => Err(CadenceError::ShutDown),
        }
    }

    /// Latches the first fatal error.
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.is_fatal()
            && self.status == EngineStatus::Running
        {
            log::error!("engine halted: {err}");
            self.status = EngineStatus::Halted(err.clone());
        }
        result
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("engine drop: shutdown failed: {e}");
        }
    }
}

impl<B: Backend> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("status", &self.status)
            .field("timeline", &self.timeline)
            .field("pacer", &self.pacer)
            .finish_non_exhaustive()
    }
}
