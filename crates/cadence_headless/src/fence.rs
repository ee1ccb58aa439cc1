use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::{DeviceFence, FenceValue, FenceWait};
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct FenceState {
    value: FenceValue,
    lost: bool,
}

/// Shared state of a headless fence. The queue signals it, waiters block on
/// its condition variable.
#[derive(Debug)]
pub(crate) struct FenceCell {
    state: Mutex<FenceState>,
    changed: Condvar,
}

impl FenceCell {
    pub(crate) fn new(initial: FenceValue) -> Self {
        Self { state: Mutex::new(FenceState { value: initial, lost: false }), changed: Condvar::new() }
    }

    pub(crate) fn signal(&self, value: FenceValue) {
        let mut state = self.state.lock();
        state.value = state.value.max(value);
        self.changed.notify_all();
    }

    pub(crate) fn mark_lost(&self) {
        self.state.lock().lost = true;
        self.changed.notify_all();
    }
}

/// Fence handed out by [`HeadlessDevice`](crate::HeadlessDevice).
#[derive(Debug, Clone)]
pub struct HeadlessFence {
    pub(crate) cell: Arc<FenceCell>,
}

impl DeviceFence for HeadlessFence {
    fn completed_value(&self) -> FenceValue {
        self.cell.state.lock().value
    }

    fn wait(&self, value: FenceValue, timeout: Option<Duration>) -> FenceWait {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.cell.state.lock();
        loop {
            if state.value >= value {
                return FenceWait::Reached;
            }
            if state.lost {
                return FenceWait::Lost;
            }
            match deadline {
                None => self.cell.changed.wait(&mut state),
                Some(deadline) => {
                    if self.cell.changed.wait_until(&mut state, deadline).timed_out() {
                        return if state.value >= value {
                            FenceWait::Reached
                        } else if state.lost {
                            FenceWait::Lost
                        } else {
                            FenceWait::TimedOut
                        };
                    }
                }
            }
        }
    }
}
