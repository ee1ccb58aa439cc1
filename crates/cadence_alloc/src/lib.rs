//! Cadence Allocators
//!
//! Fence-tagged containers that recycle or destroy device memory only once
//! the GPU is done with it:
//!
//! - [`pool`]: generic [`ResourcePool`] for command allocators and staging buffers
//! - [`ring`]: the [`RingAllocator`] upload ring
//! - [`staging`]: [`StagingRouter`], choosing between ring and dedicated buffers
//! - [`graveyard`]: deferred destruction of arbitrary resources
//!
//! All of them implement [`Reclaim`], so a submission tracker can retire them
//! uniformly after each completion query.

pub mod graveyard;
pub mod pool;
pub mod reclaim;
pub mod ring;
pub mod staging;

pub use graveyard::Graveyard;
pub use pool::{PendingItem, PoolKey, PoolStats, Pooled, ResourcePool};
pub use reclaim::Reclaim;
pub use ring::{RingAllocator, RingRegion, RingStats};
pub use staging::{ReadbackAllocation, StagingRouter, StagingStats, UploadAllocation, fits_request};
