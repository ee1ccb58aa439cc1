//! Cadence Core
//!
//! Foundation types shared by every Cadence crate:
//!
//! - [`fence`]: the per-queue [`FenceTimeline`]
//! - [`device`]: capability traits a native backend implements
//! - [`settings`]: [`EngineSettings`]
//! - [`errors`]: [`CadenceError`] and its classification
//! - [`align`]: power-of-two alignment helpers

pub mod align;
pub mod device;
pub mod errors;
pub mod fence;
pub mod settings;

pub use align::{align_up, checked_align_up, validate_alignment};
pub use device::{
    Backend, CommandQueue, DeviceAddress, DeviceFence, DeviceStatus, FenceWait, HostMapped,
    Poolable, ResourceFactory, StagingKind, StagingMemory,
};
pub use errors::{CadenceError, ErrorKind, Result, misuse};
pub use fence::{FenceSource, FenceTimeline, FenceValue};
pub use settings::EngineSettings;
