//! Frame Loop Demo
//!
//! Runs a Cadence engine against the threaded headless device: every frame
//! streams a batch of uploads into a device buffer, occasionally reads the
//! result back, and lets the pacer keep the CPU within the frame budget.
//!
//! Usage: `frame_loop [frames]` (default 240). Set `RUST_LOG=debug` for pool
//! and ring activity.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use cadence::cadence_headless::{ExecutionMode, HeadlessDevice};
use cadence::prelude::*;
use cadence::HostMapped;

const VERTEX_BYTES: u64 = 64 * 1024;
const TEXTURE_BYTES: u64 = 2 * 1024 * 1024;
const READBACK_EVERY: u64 = 60;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let frames: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().with_context(|| format!("invalid frame count '{arg}'"))?,
        None => 240,
    };

    let device = Arc::new(HeadlessDevice::new(ExecutionMode::Threaded { latency: Duration::from_millis(2) })?);
    let settings = EngineSettings { ring_buffer_size: 8 * 1024 * 1024, ..EngineSettings::low_memory() };
    let mut engine = Engine::new(Arc::clone(&device), settings)?;

    let vertex_buffer = device.create_buffer(VERTEX_BYTES);
    let texture = device.create_buffer(TEXTURE_BYTES);

    let start = Instant::now();
    for _ in 0..frames {
        let frame = engine.begin_frame()?;
        let seed = frame.frame() as u8;

        // Per-frame vertex data through the ring.
        let mut vertices = engine.allocate_upload(VERTEX_BYTES, 256)?;
        vertices.as_mut_slice().fill(seed);
        let mut recording = engine.acquire_command_allocator()?;
        recording.list_mut().copy(vertices.device_address(), vertex_buffer.device_address(), VERTEX_BYTES);

        // A texture streamed in every few frames; too large for the ring.
        let texture_upload = if frame.frame() % 16 == 1 {
            let mut upload = engine.allocate_upload(TEXTURE_BYTES, 512)?;
            upload.as_mut_slice().fill(seed.wrapping_add(1));
            recording.list_mut().copy(upload.device_address(), texture.device_address(), TEXTURE_BYTES);
            Some(upload)
        } else {
            None
        };

        recording.list_mut().marker(frame.frame());
        engine.submit(recording, false)?;
        engine.free_upload(vertices)?;
        if let Some(upload) = texture_upload {
            engine.free_upload(upload)?;
        }

        // Scratch buffer the GPU might still touch; destroyed once it is done.
        engine.defer_release(device.create_buffer(4096));

        if frame.frame() % READBACK_EVERY == 0 {
            verify_vertices(&mut engine, &vertex_buffer, seed)?;
            log::info!("frame {}:\n{}", frame.frame(), engine.diagnostics());
        }

        engine.end_frame(frame)?;
    }
    engine.wait_idle()?;

    let elapsed = start.elapsed();
    let diagnostics = engine.diagnostics();
    println!("{frames} frames in {elapsed:.2?} ({:.1} fps)", frames as f64 / elapsed.as_secs_f64());
    println!("{diagnostics}");
    println!(
        "device: {} batches executed, {} command allocators created, {} markers",
        device.executed_batches(),
        device.allocators_created(),
        device.markers().len()
    );

    engine.shutdown()?;
    Ok(())
}

/// Copies the vertex buffer into a readback buffer and checks every byte.
fn verify_vertices(
    engine: &mut Engine<HeadlessDevice>,
    vertex_buffer: &impl HostMapped,
    expected: u8,
) -> anyhow::Result<()> {
    let readback = engine.allocate_readback(VERTEX_BYTES)?;
    let mut recording = engine.acquire_command_allocator()?;
    recording.list_mut().copy(vertex_buffer.device_address(), readback.device_address(), VERTEX_BYTES);
    engine.submit(recording, true)?;

    if let Some(pos) = readback.as_slice().iter().position(|&b| b != expected) {
        bail!("vertex byte {pos} is {:#x}, expected {expected:#x}", readback.as_slice()[pos]);
    }
    engine.free_readback(readback)?;
    Ok(())
}
