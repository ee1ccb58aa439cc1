//! Error Types
//!
//! This module defines the error type shared by every Cadence crate.
//!
//! # Overview
//!
//! [`CadenceError`] groups failures into five kinds (see [`ErrorKind`]):
//! - **Exhaustion**: a pool hit its cap or the upload ring is full. Recoverable
//!   through a fallback path or by retrying next frame.
//! - **Timeout**: a bounded fence wait expired. Recoverable by escalating to an
//!   unbounded wait.
//! - **DeviceLost**: fatal. The owning engine halts all further submission.
//! - **Misuse**: a programming error. Debug builds abort at the call site via
//!   [`misuse`]; release builds log it and refuse the operation.
//! - **Backend**: a device call (create, reset, execute) reported failure.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::errors::{CadenceError, ErrorKind, Result};
//!
//! fn upload() -> Result<()> {
//!     match engine.allocate_upload(4096, 256) {
//!         Err(e) if e.kind() == ErrorKind::Exhaustion => retry_next_frame(),
//!         other => other.map(|_| ()),
//!     }
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::fence::FenceValue;

/// The main error type for Cadence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CadenceError {
    // ========================================================================
    // Exhaustion
    // ========================================================================
    /// A resource pool reached its hard cap with nothing idle to evict.
    #[error("Pool '{pool}' exhausted: {live} of {cap} resources are in use or pending")]
    PoolExhausted {
        /// Name of the pool
        pool: &'static str,
        /// Resources currently owned by the pool or its callers
        live: usize,
        /// Configured hard cap
        cap: usize,
    },

    /// The upload ring has no contiguous free range large enough.
    #[error("Upload ring exhausted: requested {requested} bytes with {used} of {capacity} bytes in flight")]
    RingExhausted {
        /// Aligned size of the failed request
        requested: u64,
        /// Approximate bytes still in flight
        used: u64,
        /// Total ring size
        capacity: u64,
    },

    // ========================================================================
    // Timeout
    // ========================================================================
    /// A bounded fence wait expired before the GPU reached the value.
    #[error("Timed out after {waited:?} waiting for fence {expected} (completed: {observed})")]
    Timeout {
        /// Fence value the caller waited for
        expected: FenceValue,
        /// Completed value observed when the wait gave up
        observed: FenceValue,
        /// Time actually spent waiting
        waited: Duration,
    },

    // ========================================================================
    // Device loss
    // ========================================================================
    /// The device was removed or reset. Never retried.
    #[error("Device lost: {reason} (completed fence: {observed})")]
    DeviceLost {
        /// Backend-provided description
        reason: String,
        /// Fence value being waited on, if the loss surfaced during a wait
        expected: Option<FenceValue>,
        /// Last completed value observed
        observed: FenceValue,
    },

    // ========================================================================
    // Misuse
    // ========================================================================
    /// Alignment was zero or not a power of two.
    #[error("Invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(u64),

    /// A zero-byte allocation was requested.
    #[error("Zero-sized allocation requested")]
    ZeroSizedAllocation,

    /// A write or read fell outside a staging allocation.
    #[error("{len} bytes at offset {offset} exceed an allocation of {size} bytes")]
    OutOfRange {
        offset: u64,
        len: u64,
        size: u64,
    },

    /// A handle was released to a pool that does not own it, or that does not
    /// consider it checked out.
    #[error("Handle is not checked out from pool '{pool}'")]
    ForeignHandle {
        /// Name of the pool the handle was released to
        pool: &'static str,
    },

    /// A fence value was signaled that does not exceed the last signaled one.
    #[error("Fence value {value} does not advance the timeline (last signaled: {last})")]
    NonMonotonicSignal {
        /// Offending value
        value: FenceValue,
        /// Last value signaled on the timeline
        last: FenceValue,
    },

    /// An unbounded wait was requested on a value no submission will signal.
    #[error("Unbounded wait on fence {expected}, which was never signaled (last signaled: {last_signaled})")]
    UnsignaledWait {
        /// Fence value requested
        expected: FenceValue,
        /// Last value signaled on the timeline
        last_signaled: FenceValue,
    },

    /// A frame operation was issued against a slot in the wrong state.
    #[error("Frame slot {slot} is {found}, expected {expected}")]
    FrameState {
        /// Slot index
        slot: u32,
        /// State required by the operation
        expected: &'static str,
        /// State the slot was actually in
        found: &'static str,
    },

    // ========================================================================
    // Backend & lifecycle
    // ========================================================================
    /// A device call failed.
    #[error("Device call failed: {0}")]
    Backend(String),

    /// The engine has already been drained and shut down.
    #[error("Engine has been shut down")]
    ShutDown,
}

/// Coarse classification of a [`CadenceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Exhaustion,
    Timeout,
    DeviceLost,
    Misuse,
    Backend,
}

impl CadenceError {
    /// Returns the error's kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } | Self::RingExhausted { .. } => ErrorKind::Exhaustion,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DeviceLost { .. } => ErrorKind::DeviceLost,
            Self::InvalidAlignment(_)
            | Self::ZeroSizedAllocation
            | Self::OutOfRange { .. }
            | Self::ForeignHandle { .. }
            | Self::NonMonotonicSignal { .. }
            | Self::UnsignaledWait { .. }
            | Self::FrameState { .. } => ErrorKind::Misuse,
            Self::Backend(_) | Self::ShutDown => ErrorKind::Backend,
        }
    }

    /// `true` when the owning engine must stop submitting work.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost { .. })
    }

    /// `true` for exhaustion and timeouts, which degrade performance but
    /// never correctness.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Exhaustion | ErrorKind::Timeout)
    }
}

/// Reports API misuse.
///
/// Debug builds panic at the caller's location. Release builds log the error
/// and return it so the operation can be refused without corrupting state.
#[track_caller]
pub fn misuse(err: CadenceError) -> CadenceError {
    if cfg!(debug_assertions) {
        panic!("cadence API misuse: {err}");
    }
    log::error!("API misuse: {err}");
    err
}

/// Alias for `Result<T, CadenceError>`.
pub type Result<T> = std::result::Result<T, CadenceError>;
