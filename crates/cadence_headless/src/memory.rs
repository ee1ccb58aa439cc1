//! Simulated device memory.
//!
//! Every [`HostBuffer`] is registered in an [`AddressSpace`] under a fake GPU
//! virtual address. Commands executed by the headless queue resolve their
//! addresses here, so a buffer freed while the GPU still references it turns
//! into a page fault instead of silently reading stale bytes.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cadence_core::errors::Result;
use cadence_core::{DeviceAddress, HostMapped, Poolable, StagingKind, StagingMemory, align_up};
use parking_lot::{Mutex, MutexGuard};

/// Buffers start at 64 KiB boundaries, like real placed resources.
const PAGE: u64 = 64 * 1024;
const BASE_ADDRESS: DeviceAddress = 0x1_0000_0000;

#[derive(Clone, Copy)]
struct Mapping {
    ptr: NonNull<u8>,
    len: u64,
}

/// Device address to CPU mapping table.
pub struct AddressSpace {
    ranges: Mutex<BTreeMap<DeviceAddress, Mapping>>,
    next_address: AtomicU64,
    next_handle: AtomicU64,
}

// SAFETY: the raw pointers in the table are only dereferenced while the
// table's lock is held, and a range is unregistered (under the same lock)
// before its memory is freed.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    pub(crate) fn new() -> Self {
        Self {
            ranges: Mutex::new(BTreeMap::new()),
            next_address: AtomicU64::new(BASE_ADDRESS),
            next_handle: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of live buffers.
    #[must_use]
    pub fn mapped_buffers(&self) -> usize {
        self.ranges.lock().len()
    }

    pub(crate) fn lock(&self) -> ResolvedSpace<'_> {
        ResolvedSpace { ranges: self.ranges.lock() }
    }

    fn reserve(&self, len: u64) -> DeviceAddress {
        self.next_address.fetch_add(align_up(len.max(1), PAGE), Ordering::Relaxed)
    }
}

/// The address table, locked for the duration of one command.
pub(crate) struct ResolvedSpace<'a> {
    ranges: MutexGuard<'a, BTreeMap<DeviceAddress, Mapping>>,
}

impl ResolvedSpace<'_> {
    /// CPU pointer of `[address, address + len)`, if that range lies within
    /// one live buffer.
    pub(crate) fn resolve(&self, address: DeviceAddress, len: u64) -> Option<*mut u8> {
        let (&base, mapping) = self.ranges.range(..=address).next_back()?;
        let end = address.checked_add(len)?;
        if end > base + mapping.len {
            return None;
        }
        // SAFETY: `address - base < mapping.len`, inside the buffer.
        Some(unsafe { mapping.ptr.as_ptr().add((address - base) as usize) })
    }
}

/// A CPU-visible buffer with a device address.
pub struct HostBuffer {
    space: Arc<AddressSpace>,
    ptr: NonNull<u8>,
    len: u64,
    address: DeviceAddress,
    handle: u64,
    kind: StagingKind,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub(crate) fn new(space: &Arc<AddressSpace>, len: u64, kind: StagingKind) -> Self {
        let bytes = vec![0u8; len as usize].into_boxed_slice();
        let raw = Box::into_raw(bytes);
        // SAFETY: `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<u8>()) };

        let address = space.reserve(len);
        space.ranges.lock().insert(address, Mapping { ptr, len });

        let handle = space.next_handle();
        log::trace!("headless: mapped buffer {handle:#x} ({len} bytes) at {address:#x}");
        Self { space: Arc::clone(space), ptr, len, address, handle, kind }
    }

    /// Copies the buffer's current contents.
    #[must_use]
    pub fn read_all(&self) -> Vec<u8> {
        let _guard = self.space.ranges.lock();
        // SAFETY: the allocation is alive and the address-space lock keeps
        // simulated GPU commands from writing it concurrently.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize) }.to_vec()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.space.ranges.lock().remove(&self.address);
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len as usize);
        // SAFETY: produced by `Box::into_raw` in `new` and no longer
        // reachable through the address space.
        drop(unsafe { Box::from_raw(slice) });
    }
}

// SAFETY: `ptr` maps `len` bytes for the buffer's whole life and
// `ptr + n` backs `address + n` in the address space.
unsafe impl HostMapped for HostBuffer {
    fn mapped_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn device_address(&self) -> DeviceAddress {
        self.address
    }

    fn byte_len(&self) -> u64 {
        self.len
    }
}

impl Poolable for HostBuffer {
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn native_handle(&self) -> u64 {
        self.handle
    }

    fn byte_size(&self) -> u64 {
        self.len
    }
}

impl StagingMemory for HostBuffer {
    fn kind(&self) -> StagingKind {
        self.kind
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("handle", &self.handle)
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}
