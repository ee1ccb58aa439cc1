//! The headless device and its queue.
//!
//! ```text
//!   execute(batch) ─┐
//!   signal(f, v) ───┼──► queue (FIFO) ──► Immediate: runs inside the call
//!                   │                     Manual:    step() / flush() / complete_through()
//!                   │                     Threaded:  worker thread, `latency` per batch
//!   lose(reason) ───┴──► queue cleared, every fence waiter woken
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use cadence_core::errors::{CadenceError, Result};
use cadence_core::{
    Backend, CommandQueue, DeviceStatus, FenceValue, ResourceFactory, StagingKind,
};
use parking_lot::{Condvar, Mutex};

use crate::commands::{GpuCommand, HeadlessBatch, HeadlessCommandAllocator, HeadlessCommandList};
use crate::fence::{FenceCell, HeadlessFence};
use crate::memory::{AddressSpace, HostBuffer};

/// How the simulated GPU makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Work completes inside `execute` / `signal`.
    Immediate,
    /// Work runs only when the owner calls [`HeadlessDevice::step`],
    /// [`HeadlessDevice::flush`] or [`HeadlessDevice::complete_through`].
    Manual,
    /// A worker thread runs work in order, sleeping `latency` per batch.
    Threaded { latency: Duration },
}

enum QueueOp {
    Execute(HeadlessBatch),
    Signal(Arc<FenceCell>, FenceValue),
}

#[derive(Default)]
struct QueueState {
    ops: VecDeque<QueueOp>,
    stopping: bool,
}

struct Shared {
    mode: ExecutionMode,
    queue: Mutex<QueueState>,
    work: Condvar,
    /// Serializes execution so ops run in submission order.
    exec: Mutex<()>,
    lost: Mutex<Option<String>>,
    fences: Mutex<Vec<Weak<FenceCell>>>,
    memory: Arc<AddressSpace>,
    executed: AtomicU64,
    last_completed: AtomicU64,
    markers: Mutex<Vec<u64>>,
    allocators_created: AtomicU64,
    failures_to_inject: AtomicUsize,
}

impl Shared {
    fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            queue: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            exec: Mutex::new(()),
            lost: Mutex::new(None),
            fences: Mutex::new(Vec::new()),
            memory: Arc::new(AddressSpace::new()),
            executed: AtomicU64::new(0),
            last_completed: AtomicU64::new(0),
            markers: Mutex::new(Vec::new()),
            allocators_created: AtomicU64::new(0),
            failures_to_inject: AtomicUsize::new(0),
        }
    }

    fn lost_error(&self) -> Option<CadenceError> {
        self.lost.lock().as_ref().map(|reason| CadenceError::DeviceLost {
            reason: reason.clone(),
            expected: None,
            observed: self.last_completed.load(Ordering::Acquire),
        })
    }

    fn enqueue(&self, op: QueueOp) -> Result<()> {
        if let Some(err) = self.lost_error() {
            return Err(err);
        }
        match self.mode {
            ExecutionMode::Immediate => {
                let _exec = self.exec.lock();
                self.process(op);
            }
            ExecutionMode::Manual | ExecutionMode::Threaded { .. } => {
                self.queue.lock().ops.push_back(op);
                self.work.notify_one();
            }
        }
        Ok(())
    }

    /// Runs one op. Returns the value it signaled, if any. Must be called
    /// with `exec` held.
    fn process(&self, op: QueueOp) -> Option<FenceValue> {
        if self.lost.lock().is_some() {
            return None;
        }
        match op {
            QueueOp::Execute(batch) => {
                for command in &batch.commands {
                    if let Err(reason) = self.run(command) {
                        self.lose(reason);
                        return None;
                    }
                }
                self.executed.fetch_add(1, Ordering::Relaxed);
                None
            }
            QueueOp::Signal(cell, value) => {
                cell.signal(value);
                self.last_completed.fetch_max(value, Ordering::AcqRel);
                Some(value)
            }
        }
    }

    fn run(&self, command: &GpuCommand) -> std::result::Result<(), String> {
        let space = self.memory.lock();
        let fault = |address: u64| format!("page fault at {address:#x} while executing {command:?}");
        match *command {
            GpuCommand::Copy { src, dst, len } => {
                let from = space.resolve(src, len).ok_or_else(|| fault(src))?;
                let to = space.resolve(dst, len).ok_or_else(|| fault(dst))?;
                // SAFETY: both ranges lie inside live buffers, and the
                // address-space lock keeps them alive for the copy.
                unsafe { std::ptr::copy(from, to, len as usize) };
            }
            GpuCommand::Fill { dst, len, value } => {
                let to = space.resolve(dst, len).ok_or_else(|| fault(dst))?;
                // SAFETY: as above.
                unsafe { std::ptr::write_bytes(to, value, len as usize) };
            }
            GpuCommand::Marker(id) => self.markers.lock().push(id),
        }
        Ok(())
    }

    fn lose(&self, reason: String) {
        {
            let mut lost = self.lost.lock();
            if lost.is_some() {
                return;
            }
            log::error!("headless device lost: {reason}");
            *lost = Some(reason);
        }
        let dropped = std::mem::take(&mut self.queue.lock().ops);
        drop(dropped);
        for cell in self.fences.lock().iter().filter_map(Weak::upgrade) {
            cell.mark_lost();
        }
    }

    fn step(&self) -> Option<Option<FenceValue>> {
        let _exec = self.exec.lock();
        let op = self.queue.lock().ops.pop_front()?;
        Some(self.process(op))
    }
}

fn worker_loop(shared: &Shared, latency: Duration) {
    loop {
        let op = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(op) = queue.ops.pop_front() {
                    break Some(op);
                }
                if queue.stopping {
                    break None;
                }
                shared.work.wait(&mut queue);
            }
        };
        let Some(op) = op else { return };
        if matches!(op, QueueOp::Execute(_)) && !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let _exec = shared.exec.lock();
        shared.process(op);
    }
}

/// A software GPU with one queue.
pub struct HeadlessDevice {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl HeadlessDevice {
    pub fn new(mode: ExecutionMode) -> Result<Self> {
        let shared = Arc::new(Shared::new(mode));
        let worker = match mode {
            ExecutionMode::Threaded { latency } => {
                let worker_shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name("cadence-headless-queue".into())
                    .spawn(move || worker_loop(&worker_shared, latency))
                    .map_err(|e| CadenceError::Backend(format!("failed to spawn queue thread: {e}")))?;
                Some(handle)
            }
            ExecutionMode::Immediate | ExecutionMode::Manual => None,
        };
        log::debug!("headless device created ({mode:?})");
        Ok(Self { shared, worker })
    }

    /// Device whose work completes during submission.
    #[must_use]
    pub fn immediate() -> Self {
        Self { shared: Arc::new(Shared::new(ExecutionMode::Immediate)), worker: None }
    }

    /// Device that only progresses when told to.
    #[must_use]
    pub fn manual() -> Self {
        Self { shared: Arc::new(Shared::new(ExecutionMode::Manual)), worker: None }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    // === Progress control ===

    /// Runs the oldest queued op. Returns `false` when the queue was empty.
    pub fn step(&self) -> bool {
        self.shared.step().is_some()
    }

    /// Runs every queued op. Returns how many ran.
    pub fn flush(&self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
        }
        count
    }

    /// Runs queued ops until a signal of at least `value` has executed or the
    /// queue is empty.
    pub fn complete_through(&self, value: FenceValue) -> usize {
        let mut count = 0;
        while let Some(signaled) = self.shared.step() {
            count += 1;
            if signaled.is_some_and(|v| v >= value) {
                break;
            }
        }
        count
    }

    /// Ops waiting to execute.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.shared.queue.lock().ops.len()
    }

    // === Failure injection ===

    /// Removes the device: queued work is dropped, fence waiters wake with
    /// [`FenceWait::Lost`](cadence_core::FenceWait::Lost), and every later
    /// queue call fails.
    pub fn lose(&self, reason: impl Into<String>) {
        self.shared.lose(reason.into());
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.shared.lost.lock().is_some()
    }

    /// Makes the next `count` resource creations fail.
    pub fn inject_creation_failures(&self, count: usize) {
        self.shared.failures_to_inject.store(count, Ordering::Release);
    }

    // === Inspection ===

    #[must_use]
    pub fn executed_batches(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn markers(&self) -> Vec<u64> {
        self.shared.markers.lock().clone()
    }

    #[must_use]
    pub fn allocators_created(&self) -> u64 {
        self.shared.allocators_created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.shared.memory
    }

    /// A device buffer for commands to copy into. CPU-readable for tests.
    #[must_use]
    pub fn create_buffer(&self, len: u64) -> HostBuffer {
        HostBuffer::new(&self.shared.memory, len, StagingKind::Readback)
    }

    fn creation_check(&self, what: &str) -> Result<()> {
        if let Some(err) = self.shared.lost_error() {
            return Err(err);
        }
        let injected = self
            .shared
            .failures_to_inject
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CadenceError::Backend(format!("injected failure creating {what}")));
        }
        Ok(())
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.shared.queue.lock().stopping = true;
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("headless queue thread panicked");
        }
    }
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice")
            .field("mode", &self.shared.mode)
            .field("pending_ops", &self.pending_ops())
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl CommandQueue for HeadlessDevice {
    type Fence = HeadlessFence;
    type Batch = HeadlessBatch;

    fn create_fence(&self, initial: FenceValue) -> Result<HeadlessFence> {
        let cell = Arc::new(FenceCell::new(initial));
        let mut fences = self.shared.fences.lock();
        fences.retain(|weak| weak.strong_count() > 0);
        fences.push(Arc::downgrade(&cell));
        drop(fences);
        if self.is_lost() {
            cell.mark_lost();
        }
        Ok(HeadlessFence { cell })
    }

    fn execute(&self, mut batch: HeadlessBatch) -> Result<()> {
        batch.enqueue();
        self.shared.enqueue(QueueOp::Execute(batch))
    }

    fn signal(&self, fence: &HeadlessFence, value: FenceValue) -> Result<()> {
        self.shared.enqueue(QueueOp::Signal(Arc::clone(&fence.cell), value))
    }

    fn device_status(&self) -> DeviceStatus {
        match self.shared.lost.lock().as_ref() {
            Some(reason) => DeviceStatus::Lost(reason.clone()),
            None => DeviceStatus::Healthy,
        }
    }
}

impl ResourceFactory for HeadlessDevice {
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type StagingBuffer = HostBuffer;
    type UploadHeap = HostBuffer;

    fn create_command_allocator(&self) -> Result<HeadlessCommandAllocator> {
        self.creation_check("command allocator")?;
        self.shared.allocators_created.fetch_add(1, Ordering::Relaxed);
        Ok(HeadlessCommandAllocator::new(self.shared.memory.next_handle()))
    }

    fn open_command_list(&self, allocator: &mut HeadlessCommandAllocator) -> Result<HeadlessCommandList> {
        Ok(allocator.open())
    }

    fn create_staging_buffer(&self, size: u64, kind: StagingKind) -> Result<HostBuffer> {
        self.creation_check("staging buffer")?;
        Ok(HostBuffer::new(&self.shared.memory, size, kind))
    }

    fn create_upload_heap(&self, size: u64) -> Result<HostBuffer> {
        self.creation_check("upload heap")?;
        Ok(HostBuffer::new(&self.shared.memory, size, StagingKind::Upload))
    }
}

impl Backend for HeadlessDevice {
    fn close_command_list(&self, list: HeadlessCommandList) -> Result<HeadlessBatch> {
        Ok(list.close())
    }
}
