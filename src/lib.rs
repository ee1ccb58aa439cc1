//! Cadence
//!
//! Fence-driven command submission and resource lifecycle for explicit GPU
//! APIs. CPU code reuses or destroys command allocators, upload memory and
//! transient resources only after the GPU has finished with them.
//!
//! The workspace is split into:
//!
//! - [`cadence_core`]: fence timeline, backend traits, settings and errors
//! - [`cadence_alloc`]: resource pools, the upload ring and the staging router
//! - [`cadence_frame`]: frame pacing, submission tracking and the [`Engine`]
//! - `cadence_headless`: a software backend (feature `headless`, on by default)

pub use cadence_alloc;
pub use cadence_core;
pub use cadence_frame;
#[cfg(feature = "headless")]
pub use cadence_headless;

pub use cadence_alloc::{
    Graveyard, PoolStats, Pooled, ReadbackAllocation, Reclaim, ResourcePool, RingAllocator, RingRegion,
    RingStats, StagingRouter, StagingStats, UploadAllocation,
};
pub use cadence_core::{
    Backend, CadenceError, CommandQueue, DeviceFence, DeviceStatus, EngineSettings, ErrorKind, FenceTimeline,
    FenceValue, FenceWait, HostMapped, Poolable, ResourceFactory, Result, StagingKind, StagingMemory,
};
pub use cadence_frame::{Engine, EngineDiagnostics, FramePacer, FrameSlot, Recording, SlotState, SubmissionTracker};

/// Everything a typical frame loop needs.
pub mod prelude {
    pub use cadence_core::{Backend, CadenceError, EngineSettings, ErrorKind, FenceValue, Result};
    pub use cadence_frame::{Engine, FrameSlot, Recording};

    #[cfg(feature = "headless")]
    pub use cadence_headless::{ExecutionMode, HeadlessDevice};
}
