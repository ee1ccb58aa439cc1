//! Staging Router
//!
//! One entry point for CPU-to-GPU uploads. Small requests are carved out of
//! the upload ring; large ones, and anything the ring cannot currently fit,
//! go to a dedicated staging buffer recycled through a [`ResourcePool`].
//! GPU-to-CPU readbacks always use dedicated buffers.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cadence_core::align::validate_alignment;
use cadence_core::errors::{CadenceError, Result};
use cadence_core::{
    DeviceAddress, EngineSettings, FenceSource, FenceValue, HostMapped, ResourceFactory, StagingKind,
    StagingMemory,
};

use crate::pool::{PoolStats, Pooled, ResourcePool};
use crate::reclaim::Reclaim;
use crate::ring::{RingAllocator, RingRegion, RingStats};

/// `true` when a pooled buffer of `candidate` bytes may serve a request of
/// `request` bytes without wasting more than half of it.
#[inline]
#[must_use]
pub fn fits_request(candidate: u64, request: u64) -> bool {
    candidate >= request && candidate <= request.saturating_mul(2)
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(CadenceError::OutOfRange { offset, len, size }),
    }
}

enum UploadSource<F: ResourceFactory> {
    Ring(RingRegion<F::UploadHeap>),
    Dedicated(Pooled<F::StagingBuffer>),
}

/// CPU-writable upload memory. Doubles as its own release token: hand it
/// back with [`StagingRouter::free`].
pub struct UploadAllocation<F: ResourceFactory> {
    source: UploadSource<F>,
    size: u64,
    ready_at: FenceValue,
}

impl<F: ResourceFactory> UploadAllocation<F> {
    #[must_use]
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        match &self.source {
            UploadSource::Ring(region) => region.cpu_ptr(),
            UploadSource::Dedicated(buffer) => buffer.mapped_ptr(),
        }
    }

    #[must_use]
    pub fn device_address(&self) -> DeviceAddress {
        match &self.source {
            UploadSource::Ring(region) => region.device_address(),
            UploadSource::Dedicated(buffer) => buffer.device_address(),
        }
    }

    /// Requested size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fence value the memory was tagged with when allocated.
    #[inline]
    #[must_use]
    pub fn ready_at(&self) -> FenceValue {
        self.ready_at
    }

    #[inline]
    #[must_use]
    pub fn is_ring(&self) -> bool {
        matches!(self.source, UploadSource::Ring(_))
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        match &mut self.source {
            UploadSource::Ring(region) => &mut region.as_mut_slice()[..size],
            // SAFETY: the pooled buffer is checked out to this allocation
            // alone and is at least `size` bytes long.
            UploadSource::Dedicated(buffer) => unsafe {
                std::slice::from_raw_parts_mut(buffer.mapped_ptr().as_ptr(), size)
            },
        }
    }

    /// Copies `data` to `offset` bytes into the allocation.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.size)?;
        let start = offset as usize;
        self.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl<F: ResourceFactory> std::fmt::Debug for UploadAllocation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadAllocation")
            .field("ring", &self.is_ring())
            .field("size", &self.size)
            .field("ready_at", &self.ready_at)
            .field("device_address", &format_args!("{:#x}", self.device_address()))
            .finish()
    }
}

/// A dedicated buffer the GPU writes into and the CPU reads back.
pub struct ReadbackAllocation<F: ResourceFactory> {
    buffer: Pooled<F::StagingBuffer>,
    size: u64,
}

impl<F: ResourceFactory> ReadbackAllocation<F> {
    #[must_use]
    pub fn device_address(&self) -> DeviceAddress {
        self.buffer.device_address()
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// CPU view of the buffer. Only meaningful once the submission that
    /// writes it has completed.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer is checked out to this allocation alone and is
        // at least `size` bytes long.
        unsafe { std::slice::from_raw_parts(self.buffer.mapped_ptr().as_ptr(), self.size as usize) }
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        check_range(offset, out.len(), self.size)?;
        let start = offset as usize;
        out.copy_from_slice(&self.as_slice()[start..start + out.len()]);
        Ok(())
    }
}

impl<F: ResourceFactory> std::fmt::Debug for ReadbackAllocation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadbackAllocation")
            .field("size", &self.size)
            .field("device_address", &format_args!("{:#x}", self.device_address()))
            .finish()
    }
}

/// Snapshot of the router's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StagingStats {
    pub ring_uses: u64,
    pub dedicated_uses: u64,
    /// Ring-sized requests that fell back because the ring was full.
    pub ring_fallbacks: u64,
    pub readbacks: u64,
    pub ring: Option<RingStats>,
    pub pool: PoolStats,
}

/// Routes uploads between the ring and dedicated staging buffers.
pub struct StagingRouter<F: ResourceFactory> {
    factory: Arc<F>,
    ring: Option<RingAllocator<F::UploadHeap>>,
    buffers: ResourcePool<F::StagingBuffer>,
    threshold: u64,
    ring_uses: AtomicU64,
    dedicated_uses: AtomicU64,
    ring_fallbacks: AtomicU64,
    readbacks: AtomicU64,
}

impl<F: ResourceFactory> StagingRouter<F> {
    /// Creates the upload heap (unless the ring is disabled) and an empty
    /// dedicated pool. `settings` should already be validated.
    pub fn new(factory: Arc<F>, settings: &EngineSettings) -> Result<Self> {
        let ring = if settings.ring_buffer_size > 0 {
            let heap = factory.create_upload_heap(settings.ring_buffer_size)?;
            Some(RingAllocator::new(heap)?)
        } else {
            None
        };
        Ok(Self {
            factory,
            ring,
            buffers: ResourcePool::new("staging buffers", settings.max_staging_buffers),
            threshold: settings.ring_upload_threshold,
            ring_uses: AtomicU64::new(0),
            dedicated_uses: AtomicU64::new(0),
            ring_fallbacks: AtomicU64::new(0),
            readbacks: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn ring(&self) -> Option<&RingAllocator<F::UploadHeap>> {
        self.ring.as_ref()
    }

    /// Allocates upload memory readable by the submission that signals
    /// `ready_at`.
    pub fn allocate_upload(
        &self,
        size: u64,
        alignment: u64,
        ready_at: FenceValue,
        fence: &impl FenceSource,
    ) -> Result<UploadAllocation<F>> {
        if size == 0 {
            return Err(CadenceError::ZeroSizedAllocation);
        }
        validate_alignment(alignment)?;

        if let Some(ring) = &self.ring
            && size <= self.threshold
        {
            match ring.allocate(size, alignment, ready_at) {
                Ok(region) => {
                    self.ring_uses.fetch_add(1, Ordering::Relaxed);
                    return Ok(UploadAllocation { source: UploadSource::Ring(region), size, ready_at });
                }
                Err(CadenceError::RingExhausted { used, capacity, .. }) => {
                    self.ring_fallbacks.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "upload ring full ({used}/{capacity} bytes in flight), using a dedicated buffer for {size} bytes"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let buffer = self.acquire_buffer(size, StagingKind::Upload, fence)?;
        self.dedicated_uses.fetch_add(1, Ordering::Relaxed);
        Ok(UploadAllocation { source: UploadSource::Dedicated(buffer), size, ready_at })
    }

    /// Returns upload memory. Ring regions retire on their own; dedicated
    /// buffers become reusable once both `ready_at` and the allocation's own
    /// tag have completed.
    pub fn free(&self, allocation: UploadAllocation<F>, ready_at: FenceValue) -> Result<()> {
        let UploadAllocation { source, ready_at: tagged, .. } = allocation;
        match source {
            UploadSource::Ring(_) => Ok(()),
            UploadSource::Dedicated(buffer) => self.buffers.release(buffer, ready_at.max(tagged)),
        }
    }

    /// Allocates a dedicated buffer for the GPU to write `size` bytes into.
    pub fn allocate_readback(&self, size: u64, fence: &impl FenceSource) -> Result<ReadbackAllocation<F>> {
        if size == 0 {
            return Err(CadenceError::ZeroSizedAllocation);
        }
        let buffer = self.acquire_buffer(size, StagingKind::Readback, fence)?;
        self.readbacks.fetch_add(1, Ordering::Relaxed);
        Ok(ReadbackAllocation { buffer, size })
    }

    pub fn free_readback(&self, allocation: ReadbackAllocation<F>, ready_at: FenceValue) -> Result<()> {
        self.buffers.release(allocation.buffer, ready_at)
    }

    /// Retires ring regions and reclaims dedicated buffers through
    /// `completed`.
    pub fn retire(&self, completed: FenceValue) -> usize {
        let ring = self.ring.as_ref().map_or(0, |r| r.retire(completed));
        ring + self.buffers.reclaim(&completed)
    }

    /// Releases everything. The caller guarantees the GPU is idle.
    pub fn drain(&self) -> usize {
        let ring = self.ring.as_ref().map_or(0, RingAllocator::drain);
        ring + self.buffers.drain()
    }

    #[must_use]
    pub fn stats(&self) -> StagingStats {
        StagingStats {
            ring_uses: self.ring_uses.load(Ordering::Relaxed),
            dedicated_uses: self.dedicated_uses.load(Ordering::Relaxed),
            ring_fallbacks: self.ring_fallbacks.load(Ordering::Relaxed),
            readbacks: self.readbacks.load(Ordering::Relaxed),
            ring: self.ring.as_ref().map(RingAllocator::stats),
            pool: self.buffers.stats(),
        }
    }

    fn acquire_buffer(
        &self,
        size: u64,
        kind: StagingKind,
        fence: &impl FenceSource,
    ) -> Result<Pooled<F::StagingBuffer>> {
        self.buffers.acquire(
            fence,
            |b: &F::StagingBuffer| b.kind() == kind && fits_request(b.byte_len(), size),
            || self.factory.create_staging_buffer(size, kind),
        )
    }
}

impl<F: ResourceFactory> Reclaim for StagingRouter<F> {
    fn label(&self) -> &'static str {
        "staging"
    }

    fn reclaim_completed(&self, completed: FenceValue) -> usize {
        self.retire(completed)
    }

    fn drain_all(&self) -> usize {
        self.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::fits_request;

    #[test]
    fn fits_request_allows_up_to_twice_the_size() {
        assert!(fits_request(1024, 1024));
        assert!(fits_request(2048, 1024));
        assert!(!fits_request(2049, 1024));
        assert!(!fits_request(1023, 1024));
    }
}
