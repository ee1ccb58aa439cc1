//! Fence Timeline
//!
//! A per-queue, monotonically increasing completion counter. Every other
//! component asks the timeline one question: "has the GPU finished work item
//! N?". Value 0 means nothing was ever submitted and is always complete.
//!
//! The timeline caches the highest completed value it has observed with an
//! atomic max, so `completed_value()` never regresses even if a backend
//! briefly reports a stale value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::device::{CommandQueue, DeviceFence, DeviceStatus, FenceWait};
use crate::errors::{CadenceError, Result, misuse};

/// Monotonically increasing completion value of a queue.
pub type FenceValue = u64;

/// Anything that can report the highest completed fence value.
///
/// Pools and the ring take a `&impl FenceSource` so they issue exactly one
/// completion query per call. A plain [`FenceValue`] is a source that is
/// already resolved.
pub trait FenceSource {
    fn completed_value(&self) -> FenceValue;
}

impl FenceSource for FenceValue {
    #[inline]
    fn completed_value(&self) -> FenceValue {
        *self
    }
}

/// The completion counter of one queue.
pub struct FenceTimeline<Q: CommandQueue> {
    queue: Arc<Q>,
    fence: Q::Fence,
    last_signaled: AtomicU64,
    completed_cache: AtomicU64,
}

impl<Q: CommandQueue> FenceTimeline<Q> {
    /// Creates the timeline's device fence with initial value 0.
    pub fn new(queue: Arc<Q>) -> Result<Self> {
        let fence = queue.create_fence(0)?;
        Ok(Self {
            queue,
            fence,
            last_signaled: AtomicU64::new(0),
            completed_cache: AtomicU64::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    #[inline]
    #[must_use]
    pub fn fence(&self) -> &Q::Fence {
        &self.fence
    }

    /// The last value handed to `signal`.
    #[inline]
    #[must_use]
    pub fn last_signaled(&self) -> FenceValue {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// The value the next `signal_next()` will produce.
    #[inline]
    #[must_use]
    pub fn next_value(&self) -> FenceValue {
        self.last_signaled() + 1
    }

    /// Schedules the queue to mark `value` complete once all previously
    /// enqueued work has finished.
    pub fn signal(&self, value: FenceValue) -> Result<()> {
        let last = self.last_signaled();
        if value <= last {
            return Err(misuse(CadenceError::NonMonotonicSignal { value, last }));
        }
        self.queue.signal(&self.fence, value)?;
        self.last_signaled.store(value, Ordering::Release);
        log::trace!("signaled fence {value}");
        Ok(())
    }

    /// Signals `last_signaled() + 1` and returns it.
    pub fn signal_next(&self) -> Result<FenceValue> {
        let value = self.next_value();
        self.signal(value)?;
        Ok(value)
    }

    /// Highest value the GPU has confirmed. Never regresses.
    #[must_use]
    pub fn completed_value(&self) -> FenceValue {
        let observed = self.fence.completed_value();
        let previous = self.completed_cache.fetch_max(observed, Ordering::AcqRel);
        previous.max(observed)
    }

    #[inline]
    #[must_use]
    pub fn is_complete(&self, value: FenceValue) -> bool {
        value == 0 || self.completed_value() >= value
    }

    /// Blocks until `value` is complete.
    ///
    /// `None` waits without bound, which is only legal for values that were
    /// actually signaled. Device loss is checked before and after the wait
    /// and reported as [`CadenceError::DeviceLost`], never retried.
    pub fn wait_until(&self, value: FenceValue, timeout: Option<Duration>) -> Result<()> {
        if self.is_complete(value) {
            return Ok(());
        }
        if let DeviceStatus::Lost(reason) = self.queue.device_status() {
            return Err(self.lost(reason, Some(value)));
        }
        if timeout.is_none() && value > self.last_signaled() {
            return Err(CadenceError::UnsignaledWait {
                expected: value,
                last_signaled: self.last_signaled(),
            });
        }

        let start = Instant::now();
        match self.fence.wait(value, timeout) {
            FenceWait::Reached => {
                self.completed_value();
                Ok(())
            }
            FenceWait::TimedOut => match self.queue.device_status() {
                DeviceStatus::Lost(reason) => Err(self.lost(reason, Some(value))),
                DeviceStatus::Healthy => Err(CadenceError::Timeout {
                    expected: value,
                    observed: self.completed_value(),
                    waited: start.elapsed(),
                }),
            },
            FenceWait::Lost => {
                let reason = match self.queue.device_status() {
                    DeviceStatus::Lost(reason) => reason,
                    DeviceStatus::Healthy => "fence wait aborted by the device".to_owned(),
                };
                Err(self.lost(reason, Some(value)))
            }
        }
    }

    /// Returns the device-lost error if the queue's device is gone.
    pub fn check_device(&self) -> Result<()> {
        match self.queue.device_status() {
            DeviceStatus::Healthy => Ok(()),
            DeviceStatus::Lost(reason) => Err(self.lost(reason, None)),
        }
    }

    fn lost(&self, reason: String, expected: Option<FenceValue>) -> CadenceError {
        let observed = self.completed_value();
        log::error!("device lost while at fence {observed}: {reason}");
        CadenceError::DeviceLost { reason, expected, observed }
    }
}

impl<Q: CommandQueue> FenceSource for FenceTimeline<Q> {
    #[inline]
    fn completed_value(&self) -> FenceValue {
        FenceTimeline::completed_value(self)
    }
}

impl<Q: CommandQueue> std::fmt::Debug for FenceTimeline<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceTimeline")
            .field("last_signaled", &self.last_signaled())
            .field("completed", &self.completed_cache.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
