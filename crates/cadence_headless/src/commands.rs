//! Command allocators, lists and batches of the headless device.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cadence_core::errors::{CadenceError, Result};
use cadence_core::{DeviceAddress, Poolable};

/// One simulated GPU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuCommand {
    Copy { src: DeviceAddress, dst: DeviceAddress, len: u64 },
    Fill { dst: DeviceAddress, len: u64, value: u8 },
    /// No memory access; records `id` in the device's marker log.
    Marker(u64),
}

/// Backing store of recorded commands. Tracks how many of the batches
/// recorded into it the device has not finished.
#[derive(Debug)]
pub struct HeadlessCommandAllocator {
    handle: u64,
    in_flight: Arc<AtomicUsize>,
    resets: u64,
}

impl HeadlessCommandAllocator {
    pub(crate) fn new(handle: u64) -> Self {
        Self { handle, in_flight: Arc::new(AtomicUsize::new(0)), resets: 0 }
    }

    /// Batches recorded here that are executing or queued.
    #[must_use]
    pub fn lists_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub(crate) fn open(&self) -> HeadlessCommandList {
        HeadlessCommandList { commands: Vec::new(), in_flight: Arc::clone(&self.in_flight) }
    }
}

impl Poolable for HeadlessCommandAllocator {
    fn reset(&mut self) -> Result<()> {
        let in_flight = self.lists_in_flight();
        if in_flight > 0 {
            return Err(CadenceError::Backend(format!(
                "command allocator {:#x} reset with {in_flight} command lists still executing",
                self.handle
            )));
        }
        self.resets += 1;
        Ok(())
    }

    fn native_handle(&self) -> u64 {
        self.handle
    }
}

/// A command list in the recording state.
#[derive(Debug)]
pub struct HeadlessCommandList {
    commands: Vec<GpuCommand>,
    in_flight: Arc<AtomicUsize>,
}

impl HeadlessCommandList {
    pub fn copy(&mut self, src: DeviceAddress, dst: DeviceAddress, len: u64) -> &mut Self {
        self.commands.push(GpuCommand::Copy { src, dst, len });
        self
    }

    pub fn fill(&mut self, dst: DeviceAddress, len: u64, value: u8) -> &mut Self {
        self.commands.push(GpuCommand::Fill { dst, len, value });
        self
    }

    pub fn marker(&mut self, id: u64) -> &mut Self {
        self.commands.push(GpuCommand::Marker(id));
        self
    }

    #[must_use]
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub(crate) fn close(self) -> HeadlessBatch {
        HeadlessBatch { commands: self.commands, in_flight: self.in_flight, counted: false }
    }
}

/// A closed command list.
#[derive(Debug)]
pub struct HeadlessBatch {
    pub(crate) commands: Vec<GpuCommand>,
    in_flight: Arc<AtomicUsize>,
    counted: bool,
}

impl HeadlessBatch {
    /// Marks the batch as executing on its allocator.
    pub(crate) fn enqueue(&mut self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.counted = true;
    }
}

impl Drop for HeadlessBatch {
    fn drop(&mut self) {
        if self.counted {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
