//! Deferred destruction of arbitrary resources.
//!
//! Anything the GPU might still reference (a texture replaced mid-frame, a
//! buffer whose owner went away) is buried with the fence value of the last
//! submission that can touch it, and dropped once that value completes.

use std::any::Any;
use std::collections::VecDeque;

use cadence_core::FenceValue;
use parking_lot::Mutex;

use crate::reclaim::Reclaim;

type Corpse = Box<dyn Any + Send>;

#[derive(Default)]
pub struct Graveyard {
    buried: Mutex<VecDeque<(FenceValue, Corpse)>>,
}

impl Graveyard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `resource` alive until `ready_at` completes.
    pub fn bury<R: Any + Send>(&self, ready_at: FenceValue, resource: R) {
        self.buried.lock().push_back((ready_at, Box::new(resource)));
    }

    /// Drops everything buried at or before `completed`.
    pub fn collect(&self, completed: FenceValue) -> usize {
        let dead: Vec<Corpse> = {
            let mut buried = self.buried.lock();
            let count = buried.iter().take_while(|(at, _)| *at <= completed).count();
            buried.drain(..count).map(|(_, r)| r).collect()
        };
        let count = dead.len();
        drop(dead);
        if count > 0 {
            log::trace!("graveyard: destroyed {count} resources through fence {completed}");
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buried.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buried.lock().is_empty()
    }

    /// Drops everything. The caller guarantees the GPU is idle.
    pub fn drain(&self) -> usize {
        let dead = std::mem::take(&mut *self.buried.lock());
        dead.len()
    }
}

impl Reclaim for Graveyard {
    fn label(&self) -> &'static str {
        "graveyard"
    }

    fn reclaim_completed(&self, completed: FenceValue) -> usize {
        self.collect(completed)
    }

    fn drain_all(&self) -> usize {
        self.drain()
    }
}

impl std::fmt::Debug for Graveyard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graveyard").field("buried", &self.len()).finish()
    }
}
