//! Engine Settings
//!
//! Sizing and pacing configuration consumed once when an engine is created.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cadence::EngineSettings;
//!
//! // Defaults: triple buffering, 128 MiB upload ring
//! let settings = EngineSettings::default();
//!
//! // Smaller ring and double buffering for memory-constrained devices
//! let settings = EngineSettings {
//!     max_staging_buffers: 16,
//!     ..EngineSettings::low_memory()
//! };
//! ```

use std::time::Duration;

use crate::align::align_up;

const MIB: u64 = 1024 * 1024;

/// Smallest frames-in-flight count that still overlaps CPU and GPU work.
pub const MIN_FRAMES_IN_FLIGHT: u32 = 2;
/// Largest frames-in-flight count before latency stops being worth it.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

/// Global configuration for one engine (one queue).
///
/// # Fields
///
/// | Field                    | Description                                   | Default   |
/// |--------------------------|-----------------------------------------------|-----------|
/// | `ring_buffer_size`       | Bytes in the shared upload ring (0 disables)  | 128 MiB   |
/// | `max_frames_in_flight`   | Frames the CPU may run ahead of the GPU       | 3         |
/// | `max_command_allocators` | Hard cap of the command-allocator pool        | 256       |
/// | `max_staging_buffers`    | Hard cap of the dedicated staging pool        | 64        |
/// | `ring_upload_threshold`  | Largest upload served by the ring             | 1 MiB     |
/// | `upload_alignment`       | Alignment of `allocate_upload_default`        | 256       |
/// | `bounded_frame_wait`     | First-tier wait before escalating             | 5 s       |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    // === Upload ring ===
    /// Size of the persistently mapped upload ring.
    ///
    /// Zero disables the ring; every upload then goes to a dedicated buffer.
    pub ring_buffer_size: u64,

    /// Uploads larger than this bypass the ring.
    pub ring_upload_threshold: u64,

    /// Alignment used by `Engine::allocate_upload_default`; the ring size is
    /// rounded up to it. Rounded up to a power of two.
    pub upload_alignment: u64,

    // === Pacing ===
    /// Frames the CPU may record ahead of the GPU. Clamped to `2..=4`.
    pub max_frames_in_flight: u32,

    /// How long `begin_frame` waits on a slot before logging a warning and
    /// falling back to an unbounded wait.
    pub bounded_frame_wait: Duration,

    // === Pools ===
    pub max_command_allocators: usize,
    pub max_staging_buffers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ring_buffer_size: 128 * MIB,
            ring_upload_threshold: MIB,
            upload_alignment: 256,
            max_frames_in_flight: 3,
            bounded_frame_wait: Duration::from_secs(5),
            max_command_allocators: 256,
            max_staging_buffers: 64,
        }
    }
}

impl EngineSettings {
    /// Double buffering with a 64 MiB ring.
    #[must_use]
    pub fn low_memory() -> Self {
        Self {
            ring_buffer_size: 64 * MIB,
            max_frames_in_flight: 2,
            max_staging_buffers: 32,
            ..Self::default()
        }
    }

    /// Triple buffering with a 256 MiB ring.
    #[must_use]
    pub fn high_performance() -> Self {
        Self {
            ring_buffer_size: 256 * MIB,
            ring_upload_threshold: 4 * MIB,
            max_frames_in_flight: 3,
            ..Self::default()
        }
    }

    /// Returns a copy with every field brought into its legal range.
    #[must_use]
    pub fn validate(&self) -> Self {
        let mut s = self.clone();

        let frames = s.max_frames_in_flight.clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        if frames != s.max_frames_in_flight {
            log::warn!(
                "max_frames_in_flight {} out of range, using {frames}",
                s.max_frames_in_flight
            );
            s.max_frames_in_flight = frames;
        }

        if s.max_command_allocators == 0 {
            log::warn!("max_command_allocators is 0, using 1");
            s.max_command_allocators = 1;
        }
        if s.max_staging_buffers == 0 {
            log::warn!("max_staging_buffers is 0, using 1");
            s.max_staging_buffers = 1;
        }

        if !s.upload_alignment.is_power_of_two() {
            let fixed = s.upload_alignment.max(1).next_power_of_two();
            log::warn!("upload_alignment {} is not a power of two, using {fixed}", s.upload_alignment);
            s.upload_alignment = fixed;
        }

        if s.ring_buffer_size > 0 {
            s.ring_buffer_size = align_up(s.ring_buffer_size, s.upload_alignment);
            if s.ring_buffer_size < 32 * MIB {
                log::info!(
                    "upload ring of {} KiB is small; large frames will fall back to dedicated buffers",
                    s.ring_buffer_size / 1024
                );
            }
        }
        s.ring_upload_threshold = s.ring_upload_threshold.min(s.ring_buffer_size);

        if s.bounded_frame_wait.is_zero() {
            s.bounded_frame_wait = Duration::from_millis(1);
        }

        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let s = EngineSettings::default();
        assert_eq!(s.ring_buffer_size, 128 * MIB);
        assert_eq!(s.max_frames_in_flight, 3);
        assert_eq!(s.max_command_allocators, 256);
        assert_eq!(s.max_staging_buffers, 64);
        assert_eq!(s.ring_upload_threshold, MIB);
        assert_eq!(s.upload_alignment, 256);
        assert_eq!(s.bounded_frame_wait, Duration::from_secs(5));
        assert_eq!(s.validate(), s);
    }

    #[test]
    fn validate_repairs_out_of_range_fields() {
        let s = EngineSettings {
            ring_buffer_size: 1000,
            ring_upload_threshold: 1 << 30,
            upload_alignment: 48,
            max_frames_in_flight: 9,
            max_command_allocators: 0,
            max_staging_buffers: 0,
            bounded_frame_wait: Duration::ZERO,
        }
        .validate();

        assert_eq!(s.max_frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(s.upload_alignment, 64);
        assert_eq!(s.ring_buffer_size, 1024);
        assert_eq!(s.ring_upload_threshold, 1024);
        assert_eq!(s.max_command_allocators, 1);
        assert_eq!(s.max_staging_buffers, 1);
        assert!(!s.bounded_frame_wait.is_zero());
    }

    #[test]
    fn presets_pick_frame_counts() {
        assert_eq!(EngineSettings::low_memory().max_frames_in_flight, 2);
        assert_eq!(EngineSettings::high_performance().ring_buffer_size, 256 * MIB);
        assert_eq!(
            EngineSettings { max_frames_in_flight: 1, ..Default::default() }
                .validate()
                .max_frames_in_flight,
            MIN_FRAMES_IN_FLIGHT
        );
    }
}
