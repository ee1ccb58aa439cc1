//! Cadence Headless
//!
//! A software device implementing every Cadence backend trait. It executes
//! copy, fill and marker commands against simulated device memory, so tests
//! and demos can observe what the GPU would have read, and whether it would
//! have read memory that was already recycled.
//!
//! ```rust,ignore
//! use cadence_headless::{ExecutionMode, HeadlessDevice};
//!
//! let device = Arc::new(HeadlessDevice::new(ExecutionMode::Threaded {
//!     latency: Duration::from_millis(2),
//! })?);
//! let engine = Engine::new(device.clone(), EngineSettings::default())?;
//! ```

pub mod commands;
pub mod device;
mod fence;
pub mod memory;

pub use commands::{GpuCommand, HeadlessBatch, HeadlessCommandAllocator, HeadlessCommandList};
pub use device::{ExecutionMode, HeadlessDevice};
pub use fence::HeadlessFence;
pub use memory::{AddressSpace, HostBuffer};
