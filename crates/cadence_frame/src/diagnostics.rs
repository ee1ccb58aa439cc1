use std::fmt;

use cadence_alloc::{PoolStats, StagingStats};
use cadence_core::FenceValue;

use crate::pacer::PacerStats;

/// Read-only snapshot of an engine's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineDiagnostics {
    pub last_signaled: FenceValue,
    pub completed: FenceValue,
    pub submissions: u64,
    pub command_allocators: PoolStats,
    pub staging: StagingStats,
    pub frames: PacerStats,
    /// Resources waiting in the deferred-release queue.
    pub deferred_releases: usize,
    pub halted: bool,
}

impl EngineDiagnostics {
    /// Submitted fence values the GPU has not completed yet.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.last_signaled.saturating_sub(self.completed)
    }

    /// Utilization of the upload ring, 0 when it is disabled.
    #[must_use]
    pub fn ring_utilization(&self) -> f64 {
        self.staging.ring.map_or(0.0, |r| r.utilization())
    }
}

impl fmt::Display for EngineDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fence {}/{} ({} in flight), {} submissions", self.completed, self.last_signaled, self.in_flight(), self.submissions)?;
        writeln!(
            f,
            "command allocators: {} live, {} in use (peak {}), hit rate {:.0}%",
            self.command_allocators.live,
            self.command_allocators.in_use,
            self.command_allocators.peak_in_use,
            self.command_allocators.hit_rate() * 100.0
        )?;
        writeln!(
            f,
            "uploads: {} ring, {} dedicated, {} fallbacks, ring {:.1}% used",
            self.staging.ring_uses,
            self.staging.dedicated_uses,
            self.staging.ring_fallbacks,
            self.ring_utilization() * 100.0
        )?;
        write!(
            f,
            "frames: {} begun, {} escalated waits, {:?} blocked, {:.1} fps",
            self.frames.frames_begun, self.frames.escalated_waits, self.frames.time_blocked, self.frames.frame_rate
        )
    }
}
