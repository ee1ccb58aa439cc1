//! Submission Tracker
//!
//! Turns a recorded command list into a fence value. At submit time the list
//! is closed, executed and followed by a signal of the timeline's next value;
//! the command allocator it was recorded into is released to the pool's
//! pending FIFO under that value. After every completion query the tracker
//! retires all registered [`Reclaim`] containers in one pass.

use std::sync::Arc;

use cadence_alloc::{Graveyard, Pooled, Reclaim, ResourcePool};
use cadence_core::errors::Result;
use cadence_core::{Backend, FenceTimeline, FenceValue, ResourceFactory};

use crate::pacer::FrameSlot;

type Allocator<B> = <B as ResourceFactory>::CommandAllocator;

/// Where a recording's command allocator came from, and so where it goes
/// back to.
pub enum AllocatorOrigin<A> {
    /// Checked out of the shared pool for this one submission.
    Pool(Pooled<A>),
    /// Lent by a frame slot; returns to the slot after submission.
    Frame(FrameSlot, A),
}

/// An open command list together with the allocator backing it.
pub struct Recording<B: Backend> {
    allocator: AllocatorOrigin<Allocator<B>>,
    list: B::CommandList,
}

impl<B: Backend> Recording<B> {
    #[inline]
    pub fn list(&self) -> &B::CommandList {
        &self.list
    }

    #[inline]
    pub fn list_mut(&mut self) -> &mut B::CommandList {
        &mut self.list
    }

    /// The frame whose primary allocator backs this recording, if any.
    #[must_use]
    pub fn frame(&self) -> Option<FrameSlot> {
        match &self.allocator {
            AllocatorOrigin::Frame(slot, _) => Some(*slot),
            AllocatorOrigin::Pool(_) => None,
        }
    }
}

impl<B: Backend> std::fmt::Debug for Recording<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording").field("frame", &self.frame()).finish_non_exhaustive()
    }
}

/// Result of a successful submission.
pub struct SubmitOutcome<A> {
    pub fence: FenceValue,
    /// A frame allocator to hand back to its slot.
    pub frame_allocator: Option<(FrameSlot, A)>,
}

pub struct SubmissionTracker<B: Backend> {
    backend: Arc<B>,
    timeline: Arc<FenceTimeline<B>>,
    allocators: Arc<ResourcePool<Allocator<B>>>,
    graveyard: Arc<Graveyard>,
    reclaimers: Vec<Arc<dyn Reclaim>>,
    submissions: u64,
}

impl<B: Backend> SubmissionTracker<B> {
    /// Creates a tracker that retires `allocators` and `graveyard` after
    /// every completion query.
    #[must_use]
    pub fn new(
        backend: Arc<B>,
        timeline: Arc<FenceTimeline<B>>,
        allocators: Arc<ResourcePool<Allocator<B>>>,
        graveyard: Arc<Graveyard>,
    ) -> Self {
        let reclaimers: Vec<Arc<dyn Reclaim>> = vec![allocators.clone() as Arc<dyn Reclaim>, graveyard.clone()];
        Self { backend, timeline, allocators, graveyard, reclaimers, submissions: 0 }
    }

    /// Adds another container to retire alongside the allocator pool.
    pub fn register(&mut self, reclaimer: Arc<dyn Reclaim>) {
        log::debug!("submission tracker: retiring '{}'", reclaimer.label());
        self.reclaimers.push(reclaimer);
    }

    #[inline]
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Opens a command list on an allocator from the shared pool.
    pub fn begin(&self) -> Result<Recording<B>> {
        let mut allocator = self.allocators.acquire(
            &*self.timeline,
            |_| true,
            || self.backend.create_command_allocator(),
        )?;
        match self.backend.open_command_list(&mut allocator) {
            Ok(list) => Ok(Recording { allocator: AllocatorOrigin::Pool(allocator), list }),
            Err(e) => {
                self.allocators.discard(allocator)?;
                Err(e)
            }
        }
    }

    /// Opens a command list on a frame slot's primary allocator.
    pub fn begin_with(&self, slot: FrameSlot, mut allocator: Allocator<B>) -> Result<Recording<B>> {
        match self.backend.open_command_list(&mut allocator) {
            Ok(list) => Ok(Recording { allocator: AllocatorOrigin::Frame(slot, allocator), list }),
            Err(e) => {
                self.graveyard.bury(self.timeline.last_signaled(), allocator);
                Err(e)
            }
        }
    }

    /// Executes the recording and signals the next fence value. With
    /// `wait`, blocks until the GPU has completed it.
    pub fn submit(&mut self, recording: Recording<B>, wait: bool) -> Result<SubmitOutcome<Allocator<B>>> {
        let Recording { allocator, list } = recording;

        let executed = self
            .backend
            .close_command_list(list)
            .and_then(|batch| self.backend.execute(batch));
        if let Err(e) = executed {
            log::warn!("submission failed before signaling: {e}");
            self.dispose(allocator)?;
            return Err(e);
        }

        let fence = match self.timeline.signal_next() {
            Ok(fence) => fence,
            Err(e) => {
                let unknown = self.timeline.next_value();
                match allocator {
                    AllocatorOrigin::Pool(pooled) => self.allocators.release(pooled, unknown)?,
                    AllocatorOrigin::Frame(_, raw) => self.graveyard.bury(unknown, raw),
                }
                return Err(e);
            }
        };
        self.submissions += 1;

        let frame_allocator = match allocator {
            AllocatorOrigin::Pool(pooled) => {
                self.allocators.release(pooled, fence)?;
                None
            }
            AllocatorOrigin::Frame(slot, raw) => Some((slot, raw)),
        };

        log::trace!("submitted batch as fence {fence}");
        if wait {
            self.timeline.wait_until(fence, None)?;
            self.retire();
        }
        Ok(SubmitOutcome { fence, frame_allocator })
    }

    /// Gives up a recording without executing it.
    pub fn abandon(&self, recording: Recording<B>) -> Result<Option<(FrameSlot, Allocator<B>)>> {
        let Recording { allocator, list } = recording;
        drop(list);
        match allocator {
            AllocatorOrigin::Pool(pooled) => {
                self.allocators.release(pooled, self.timeline.last_signaled())?;
                Ok(None)
            }
            AllocatorOrigin::Frame(slot, raw) => Ok(Some((slot, raw))),
        }
    }

    /// One completion query, then every reclaimer retires through it.
    pub fn retire(&self) -> usize {
        let completed = self.timeline.completed_value();
        self.reclaimers.iter().map(|r| r.reclaim_completed(completed)).sum()
    }

    /// Waits for every value ever signaled, then releases everything.
    ///
    /// A lost device cannot read memory any more, so loss is logged and the
    /// drain proceeds.
    pub fn drain(&self) -> Result<usize> {
        let last = self.timeline.last_signaled();
        if let Err(e) = self.timeline.wait_until(last, None) {
            if !e.is_fatal() {
                return Err(e);
            }
            log::error!("draining after device loss: {e}");
        }
        let released: usize = self.reclaimers.iter().map(|r| r.drain_all()).sum();
        log::debug!("submission tracker drained {released} resources through fence {last}");
        Ok(released)
    }

    /// Disposes of an allocator whose submission failed before execution.
    fn dispose(&self, allocator: AllocatorOrigin<Allocator<B>>) -> Result<()> {
        match allocator {
            AllocatorOrigin::Pool(pooled) => self.allocators.discard(pooled),
            AllocatorOrigin::Frame(_, raw) => {
                self.graveyard.bury(self.timeline.last_signaled(), raw);
                Ok(())
            }
        }
    }
}

impl<B: Backend> std::fmt::Debug for SubmissionTracker<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionTracker")
            .field("submissions", &self.submissions)
            .field("reclaimers", &self.reclaimers.len())
            .finish_non_exhaustive()
    }
}
