//! Cadence Frame
//!
//! Frame pacing, submission tracking and the per-queue [`Engine`] that ties
//! the fence timeline, pools, upload ring and deferred destruction together.

pub mod diagnostics;
pub mod engine;
pub mod pacer;
pub mod submission;

pub use diagnostics::EngineDiagnostics;
pub use engine::Engine;
pub use pacer::{FramePacer, FrameSlot, PacerStats, SlotState};
pub use submission::{AllocatorOrigin, Recording, SubmissionTracker, SubmitOutcome};
