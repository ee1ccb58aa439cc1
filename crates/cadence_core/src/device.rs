//! Device Capability Traits
//!
//! The contract between Cadence and a native backend. Cadence never talks to
//! a graphics API directly; a backend implements these traits and the pools,
//! ring, pacer and tracker are generic over them.
//!
//! ```text
//! ┌────────────────────── Backend ───────────────────────┐
//! │ CommandQueue                 ResourceFactory         │
//! │  create_fence / signal        create_command_allocator│
//! │  execute(batch)               open_command_list      │
//! │  device_status()              create_staging_buffer  │
//! │                               create_upload_heap     │
//! │ close_command_list(list) -> batch                    │
//! └──────────────────────────────────────────────────────┘
//!        │                               │
//!   DeviceFence                 Poolable / HostMapped / StagingMemory
//! ```

use std::ptr::NonNull;
use std::time::Duration;

use crate::errors::Result;
use crate::fence::FenceValue;

/// GPU virtual address of a buffer byte.
pub type DeviceAddress = u64;

/// Health of the device behind a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Healthy,
    /// The device was removed, reset or hung. Carries the backend's reason.
    Lost(String),
}

impl DeviceStatus {
    #[inline]
    #[must_use]
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost(_))
    }
}

/// Outcome of a device-level fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Reached,
    TimedOut,
    /// The wait ended because the device is gone.
    Lost,
}

/// A device fence whose completed value only increases.
pub trait DeviceFence: Send + Sync {
    /// Highest value the device has completed.
    fn completed_value(&self) -> FenceValue;

    /// Blocks until `completed_value() >= value`, the timeout expires, or the
    /// device is lost. `None` waits without bound.
    fn wait(&self, value: FenceValue, timeout: Option<Duration>) -> FenceWait;
}

/// Minimal capability interface of a recyclable device object.
pub trait Poolable: Send + 'static {
    /// Prepares the object for reuse. Only called once the fence proves the
    /// device no longer reads from it.
    fn reset(&mut self) -> Result<()>;

    /// Backend identifier, used in logs.
    fn native_handle(&self) -> u64;

    /// Size in bytes for sized resources, 0 otherwise.
    fn byte_size(&self) -> u64 {
        0
    }
}

/// Persistently mapped, CPU-writable memory with a device address.
///
/// # Safety
///
/// `mapped_ptr()` must point to `byte_len()` bytes that stay valid and mapped
/// for as long as the implementor is alive, and `mapped_ptr() + n` must be
/// the CPU view of `device_address() + n`.
pub unsafe trait HostMapped: Send + Sync {
    fn mapped_ptr(&self) -> NonNull<u8>;
    fn device_address(&self) -> DeviceAddress;
    fn byte_len(&self) -> u64;
}

/// Direction of a staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingKind {
    /// CPU writes, device reads.
    Upload,
    /// Device writes, CPU reads.
    Readback,
}

/// A dedicated, individually mapped staging buffer.
pub trait StagingMemory: Poolable + HostMapped {
    fn kind(&self) -> StagingKind;
}

/// A device queue able to execute finalized batches and signal fences.
pub trait CommandQueue: Send + Sync + 'static {
    type Fence: DeviceFence;
    /// A finalized command list, ready for execution.
    type Batch: Send;

    fn create_fence(&self, initial: FenceValue) -> Result<Self::Fence>;

    /// Enqueues `batch` behind all previously enqueued work.
    fn execute(&self, batch: Self::Batch) -> Result<()>;

    /// Enqueues a signal of `value` on `fence` behind all previously
    /// enqueued work.
    fn signal(&self, fence: &Self::Fence, value: FenceValue) -> Result<()>;

    /// Reports whether the device is still usable. Distinguishes a slow GPU
    /// from a dead one after a wait times out.
    fn device_status(&self) -> DeviceStatus;
}

/// Constructs the native objects that Cadence pools.
pub trait ResourceFactory: Send + Sync + 'static {
    type CommandAllocator: Poolable;
    /// A command list in the recording state.
    type CommandList: Send;
    type StagingBuffer: StagingMemory;
    /// The large upload heap backing the ring allocator.
    type UploadHeap: HostMapped;

    fn create_command_allocator(&self) -> Result<Self::CommandAllocator>;

    /// Opens a command list that records into `allocator`.
    fn open_command_list(&self, allocator: &mut Self::CommandAllocator) -> Result<Self::CommandList>;

    fn create_staging_buffer(&self, size: u64, kind: StagingKind) -> Result<Self::StagingBuffer>;

    fn create_upload_heap(&self, size: u64) -> Result<Self::UploadHeap>;
}

/// A complete backend: one queue plus the factory for its resources.
pub trait Backend: CommandQueue + ResourceFactory {
    /// Finalizes a recorded list into an executable batch.
    fn close_command_list(
        &self,
        list: <Self as ResourceFactory>::CommandList,
    ) -> Result<<Self as CommandQueue>::Batch>;
}
