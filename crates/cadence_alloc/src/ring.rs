//! Upload Ring Allocator
//!
//! Sub-allocates a single persistently mapped upload heap as a circular
//! buffer. Every region is tagged with the fence value of the submission that
//! reads it; [`RingAllocator::retire`] frees regions in allocation order once
//! their value completes.
//!
//! ```text
//!            tail                 head
//!  ┌──────────┬════════════════════┬──────────────┐
//!  │   free   │  in flight (FIFO)  │     free     │   head > tail
//!  └──────────┴════════════════════┴──────────────┘
//!
//!            head                 tail
//!  ┌══════════┬────────────────────┬══════════════┐
//!  │ in flight│        free        │  in flight   │   head < tail
//!  └══════════┴────────────────────┴══════════════┘
//! ```
//!
//! Allocation never blocks: a request that does not fit fails with
//! [`CadenceError::RingExhausted`] and the caller falls back to a dedicated
//! buffer or retries next frame.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cadence_core::align::{checked_align_up, validate_alignment};
use cadence_core::errors::{CadenceError, Result};
use cadence_core::{DeviceAddress, FenceValue, HostMapped};
use parking_lot::Mutex;

use crate::reclaim::Reclaim;

/// Backing memory shared between the ring and its outstanding regions.
struct RingMemory<M> {
    heap: M,
    /// Highest fence value passed to `retire`.
    retired_through: AtomicU64,
}

/// A sub-allocation of the ring.
///
/// The holder owns `[offset, offset + size)` exclusively until the fence
/// value `ready_at` completes and the ring retires it. Writing after that
/// point is refused.
pub struct RingRegion<M: HostMapped> {
    offset: u64,
    size: u64,
    ready_at: FenceValue,
    cpu_ptr: NonNull<u8>,
    device_address: DeviceAddress,
    memory: Arc<RingMemory<M>>,
}

// SAFETY: the region is the unique CPU-side owner of its byte range; the
// pointer stays valid while `memory` keeps the mapping alive.
unsafe impl<M: HostMapped> Send for RingRegion<M> {}

impl<M: HostMapped> RingRegion<M> {
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Aligned size of the region.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn ready_at(&self) -> FenceValue {
        self.ready_at
    }

    #[inline]
    #[must_use]
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu_ptr
    }

    #[inline]
    #[must_use]
    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    /// `false` once the ring has retired this region.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.memory.retired_through.load(Ordering::Acquire) < self.ready_at
    }

    /// CPU view of the region.
    ///
    /// # Panics
    ///
    /// If the region was already retired; its bytes may belong to a newer
    /// allocation.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.is_live(), "ring region at offset {} written after retirement", self.offset);
        // SAFETY: `[offset, offset + size)` lies inside the mapped heap and no
        // other live region overlaps it.
        unsafe { std::slice::from_raw_parts_mut(self.cpu_ptr.as_ptr(), self.size as usize) }
    }
}

impl<M: HostMapped> std::fmt::Debug for RingRegion<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingRegion")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("ready_at", &self.ready_at)
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    offset: u64,
    size: u64,
    ready_at: FenceValue,
}

impl Span {
    fn overlaps(&self, offset: u64, size: u64) -> bool {
        offset < self.offset + self.size && self.offset < offset + size
    }
}

struct RingState {
    head: u64,
    tail: u64,
    pending: VecDeque<Span>,
    allocations: u64,
    failures: u64,
    peak_pending: usize,
}

impl RingState {
    /// Finds an offset for `size` bytes, or `None` when the ring is full.
    fn find_fit(&self, size: u64, alignment: u64, capacity: u64) -> Option<u64> {
        let head = checked_align_up(self.head, alignment).unwrap_or(u64::MAX);
        let fits_at_head = |limit: u64| head.checked_add(size).is_some_and(|end| end <= limit);

        if self.pending.is_empty() {
            if fits_at_head(capacity) {
                Some(head)
            } else {
                (size <= capacity).then_some(0)
            }
        } else if self.head > self.tail {
            if fits_at_head(capacity) {
                Some(head)
            } else {
                (size <= self.tail).then_some(0)
            }
        } else if self.head < self.tail {
            fits_at_head(self.tail).then_some(head)
        } else {
            None
        }
    }

    fn bytes_in_flight(&self) -> u64 {
        self.pending.iter().map(|s| s.size).sum()
    }
}

/// Snapshot of ring usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub size: u64,
    /// Bytes held by regions not yet retired.
    pub used: u64,
    pub pending: usize,
    pub allocations: u64,
    pub failures: u64,
    pub peak_pending: usize,
}

impl RingStats {
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.size == 0 { 0.0 } else { self.used as f64 / self.size as f64 }
    }
}

/// Circular sub-allocator over one mapped heap.
pub struct RingAllocator<M: HostMapped> {
    memory: Arc<RingMemory<M>>,
    size: u64,
    state: Mutex<RingState>,
}

impl<M: HostMapped> RingAllocator<M> {
    pub fn new(heap: M) -> Result<Self> {
        let size = heap.byte_len();
        if size == 0 {
            return Err(CadenceError::ZeroSizedAllocation);
        }
        log::info!("upload ring: {} KiB at {:#x}", size / 1024, heap.device_address());
        Ok(Self {
            memory: Arc::new(RingMemory { heap, retired_through: AtomicU64::new(0) }),
            size,
            state: Mutex::new(RingState {
                head: 0,
                tail: 0,
                pending: VecDeque::new(),
                allocations: 0,
                failures: 0,
                peak_pending: 0,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn heap(&self) -> &M {
        &self.memory.heap
    }

    /// Reserves `size` bytes aligned to `alignment`, usable until `ready_at`
    /// completes.
    pub fn allocate(&self, size: u64, alignment: u64, ready_at: FenceValue) -> Result<RingRegion<M>> {
        if size == 0 {
            return Err(CadenceError::ZeroSizedAllocation);
        }
        validate_alignment(alignment)?;

        let mut state = self.state.lock();
        let aligned = checked_align_up(size, alignment).filter(|&s| s <= self.size);
        let offset = aligned.and_then(|s| state.find_fit(s, alignment, self.size).map(|o| (o, s)));

        let Some((offset, aligned)) = offset else {
            state.failures += 1;
            let used = state.bytes_in_flight();
            log::trace!("ring: no room for {size} bytes ({used}/{} in flight)", self.size);
            return Err(CadenceError::RingExhausted {
                requested: aligned.unwrap_or(size),
                used,
                capacity: self.size,
            });
        };

        debug_assert!(
            state.pending.iter().all(|s| !s.overlaps(offset, aligned)),
            "ring region [{offset}, {}) overlaps an in-flight region",
            offset + aligned
        );

        if state.pending.is_empty() {
            state.tail = offset;
        }
        state.pending.push_back(Span { offset, size: aligned, ready_at });
        let end = offset + aligned;
        state.head = if end >= self.size { 0 } else { end };
        state.allocations += 1;
        state.peak_pending = state.peak_pending.max(state.pending.len());
        drop(state);

        log::trace!("ring: [{offset}, {end}) until fence {ready_at}");

        // SAFETY: `offset + aligned <= byte_len`, so the pointer stays inside
        // the mapping.
        let cpu_ptr = unsafe { self.memory.heap.mapped_ptr().add(offset as usize) };
        Ok(RingRegion {
            offset,
            size: aligned,
            ready_at,
            cpu_ptr,
            device_address: self.memory.heap.device_address() + offset,
            memory: Arc::clone(&self.memory),
        })
    }

    /// Frees every region tagged `<= completed`, in allocation order.
    pub fn retire(&self, completed: FenceValue) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while state.pending.front().is_some_and(|s| s.ready_at <= completed) {
            state.pending.pop_front();
            count += 1;
        }
        state.tail = state.pending.front().map_or(state.head, |s| s.offset);
        self.memory.retired_through.fetch_max(completed, Ordering::AcqRel);
        count
    }

    /// Head-to-tail distance.
    ///
    /// Diagnostics only: a completely full ring has `head == tail` just like
    /// an empty one and also reports 0. Use [`RingStats::used`] for an exact
    /// figure.
    #[must_use]
    pub fn used_size(&self) -> u64 {
        let state = self.state.lock();
        if state.head >= state.tail {
            state.head - state.tail
        } else {
            self.size - state.tail + state.head
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Forgets every region. The caller guarantees the GPU is idle.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.pending.len();
        let last = state.pending.iter().map(|s| s.ready_at).max().unwrap_or(0);
        state.pending.clear();
        state.tail = state.head;
        self.memory.retired_through.fetch_max(last, Ordering::AcqRel);
        count
    }

    #[must_use]
    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        RingStats {
            size: self.size,
            used: state.bytes_in_flight(),
            pending: state.pending.len(),
            allocations: state.allocations,
            failures: state.failures,
            peak_pending: state.peak_pending,
        }
    }
}

impl<M: HostMapped> Reclaim for RingAllocator<M> {
    fn label(&self) -> &'static str {
        "upload ring"
    }

    fn reclaim_completed(&self, completed: FenceValue) -> usize {
        self.retire(completed)
    }

    fn drain_all(&self) -> usize {
        self.drain()
    }
}
