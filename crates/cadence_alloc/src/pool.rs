//! Fence-Tagged Resource Pool
//!
//! A recycling pool for device objects whose reuse must wait for the GPU:
//! command allocators and dedicated staging buffers.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────── ResourcePool<T> ────────────────────────┐
//! │                                                                 │
//! │  entries:   SlotMap<PoolKey, InUse | Pending(ready_at) | Available>
//! │  available: [(key, T)]        ← most recently released at back  │
//! │  pending:   FIFO of (key, T, ready_at)                          │
//! │                                                                 │
//! │  acquire()  reclaim, reuse newest match, else create (≤ cap)    │
//! │  release()  caller → pending                                    │
//! │  reclaim()  pending → available, stops at first incomplete      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one container owns a resource at any time: `available`, the
//! caller (through a move-only [`Pooled`] handle), or `pending`. The slot
//! arena mirrors that ownership with an explicit state tag so a handle
//! released twice, or released to the wrong pool, is caught.
//!
//! Device calls (`create`, `reset`, destruction by drop) never run while the
//! pool's lock is held.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use cadence_core::errors::{CadenceError, Result, misuse};
use cadence_core::{FenceSource, FenceValue, Poolable};
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::reclaim::Reclaim;

new_key_type! {
    /// Generational key of a pooled resource.
    pub struct PoolKey;
}

/// Process-wide pool id generator. Ids only identify which pool issued a
/// handle; pools themselves are always explicit instances.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Handles ──────────────────────────────────────────────────────────────────

/// A checked-out resource. Move-only; return it with
/// [`ResourcePool::release`] or [`ResourcePool::discard`].
#[derive(Debug)]
pub struct Pooled<T> {
    resource: T,
    key: PoolKey,
    pool_id: u64,
}

impl<T> Pooled<T> {
    #[inline]
    #[must_use]
    pub fn key(&self) -> PoolKey {
        self.key
    }

    #[inline]
    #[must_use]
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.resource
    }
}

/// A released resource waiting for its fence value.
#[derive(Debug)]
pub struct PendingItem<T> {
    pub resource: T,
    pub key: PoolKey,
    pub ready_at: FenceValue,
}

// ─── Internal State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InUse,
    Pending(FenceValue),
    Available,
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquisitions served from the available list.
    pub hits: u64,
    /// Acquisitions that had to construct a resource.
    pub misses: u64,
    pub created: u64,
    pub destroyed: u64,
    /// Acquisitions refused at the cap.
    pub exhausted: u64,
    /// Pending items moved back to available.
    pub reclaimed: u64,
    pub live: usize,
    pub in_use: usize,
    pub pending: usize,
    pub available: usize,
    pub peak_in_use: usize,
}

impl PoolStats {
    /// Fraction of acquisitions served without construction.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

struct PoolState<T> {
    entries: SlotMap<PoolKey, EntryState>,
    available: Vec<(PoolKey, T)>,
    pending: VecDeque<PendingItem<T>>,
    in_use: usize,
    stats: PoolStats,
}

impl<T> PoolState<T> {
    fn reclaim_through(&mut self, completed: FenceValue) -> usize {
        let mut count = 0;
        while let Some(front) = self.pending.front() {
            if front.ready_at > completed {
                break;
            }
            let Some(item) = self.pending.pop_front() else { break };
            if let Some(state) = self.entries.get_mut(item.key) {
                debug_assert!(matches!(*state, EntryState::Pending(at) if at == item.ready_at));
                *state = EntryState::Available;
            }
            self.available.push((item.key, item.resource));
            count += 1;
        }
        self.stats.reclaimed += count as u64;
        count
    }

    fn check_out(&mut self) {
        self.in_use += 1;
        self.stats.peak_in_use = self.stats.peak_in_use.max(self.in_use);
    }
}

enum Checkout<T> {
    Reuse(PoolKey, T),
    Create(PoolKey),
    Evict(PoolKey, T),
}

// ─── Pool ─────────────────────────────────────────────────────────────────────

/// Generic fence-tagged recycling pool.
pub struct ResourcePool<T> {
    name: &'static str,
    id: u64,
    cap: usize,
    state: Mutex<PoolState<T>>,
}

impl<T: Poolable> ResourcePool<T> {
    /// Creates an empty pool holding at most `cap` live resources.
    #[must_use]
    pub fn new(name: &'static str, cap: usize) -> Self {
        Self {
            name,
            id: next_pool_id(),
            cap: cap.max(1),
            state: Mutex::new(PoolState {
                entries: SlotMap::with_key(),
                available: Vec::new(),
                pending: VecDeque::new(),
                in_use: 0,
                stats: PoolStats::default(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Checks out a resource.
    ///
    /// Queries `fence` once, reclaims every completed pending item, then
    /// returns the most recently released available item accepted by
    /// `predicate`, reset for reuse. Otherwise constructs one with `create`
    /// while under the cap. At the cap an idle non-matching item is evicted
    /// to make room; with nothing idle the call fails with
    /// [`CadenceError::PoolExhausted`].
    pub fn acquire<P, C>(&self, fence: &impl FenceSource, predicate: P, create: C) -> Result<Pooled<T>>
    where
        P: Fn(&T) -> bool,
        C: FnOnce() -> Result<T>,
    {
        let completed = fence.completed_value();

        let checkout = {
            let mut state = self.state.lock();
            state.reclaim_through(completed);

            if let Some(pos) = state.available.iter().rposition(|(_, r)| predicate(r)) {
                let (key, resource) = state.available.remove(pos);
                state.entries[key] = EntryState::InUse;
                state.stats.hits += 1;
                state.check_out();
                Checkout::Reuse(key, resource)
            } else if state.entries.len() < self.cap {
                let key = state.entries.insert(EntryState::InUse);
                state.stats.misses += 1;
                state.check_out();
                Checkout::Create(key)
            } else if !state.available.is_empty() {
                let (old_key, old) = state.available.remove(0);
                state.entries.remove(old_key);
                let key = state.entries.insert(EntryState::InUse);
                state.stats.misses += 1;
                state.stats.destroyed += 1;
                state.check_out();
                Checkout::Evict(key, old)
            } else {
                state.stats.exhausted += 1;
                let live = state.entries.len();
                log::debug!("pool '{}' exhausted at {live}/{}", self.name, self.cap);
                return Err(CadenceError::PoolExhausted { pool: self.name, live, cap: self.cap });
            }
        };

        match checkout {
            Checkout::Reuse(key, mut resource) => {
                if let Err(e) = resource.reset() {
                    log::warn!(
                        "pool '{}': reset of {:#x} failed, destroying it: {e}",
                        self.name,
                        resource.native_handle()
                    );
                    self.forget(key, true);
                    drop(resource);
                    return Err(e);
                }
                log::trace!("pool '{}': reused {:#x}", self.name, resource.native_handle());
                Ok(self.wrap(key, resource))
            }
            Checkout::Create(key) => self.construct(key, create),
            Checkout::Evict(key, old) => {
                log::debug!(
                    "pool '{}' at cap, evicting idle {:#x}",
                    self.name,
                    old.native_handle()
                );
                drop(old);
                self.construct(key, create)
            }
        }
    }

    /// Returns a checked-out resource. It becomes reusable once `ready_at`
    /// completes; nothing is reclaimed here.
    pub fn release(&self, item: Pooled<T>, ready_at: FenceValue) -> Result<()> {
        let Pooled { resource, key, pool_id } = item;
        if pool_id != self.id {
            return Err(misuse(CadenceError::ForeignHandle { pool: self.name }));
        }

        let mut state = self.state.lock();
        if state.entries.get(key) != Some(&EntryState::InUse) {
            drop(state);
            return Err(misuse(CadenceError::ForeignHandle { pool: self.name }));
        }
        state.entries[key] = EntryState::Pending(ready_at);
        state.in_use -= 1;
        state.pending.push_back(PendingItem { resource, key, ready_at });
        Ok(())
    }

    /// Moves every pending item whose fence has completed back to the
    /// available list. Stops at the first incomplete item.
    pub fn reclaim(&self, fence: &impl FenceSource) -> usize {
        let completed = fence.completed_value();
        let count = self.state.lock().reclaim_through(completed);
        if count > 0 {
            log::trace!("pool '{}': reclaimed {count} through fence {completed}", self.name);
        }
        count
    }

    /// Destroys a checked-out resource instead of recycling it, typically
    /// after a device call on it failed.
    pub fn discard(&self, item: Pooled<T>) -> Result<()> {
        let Pooled { resource, key, pool_id } = item;
        if pool_id != self.id {
            return Err(misuse(CadenceError::ForeignHandle { pool: self.name }));
        }
        {
            let mut state = self.state.lock();
            if state.entries.get(key) != Some(&EntryState::InUse) {
                drop(state);
                return Err(misuse(CadenceError::ForeignHandle { pool: self.name }));
            }
            state.entries.remove(key);
            state.in_use -= 1;
            state.stats.destroyed += 1;
        }
        drop(resource);
        Ok(())
    }

    /// Destroys idle resources beyond `keep`, oldest first.
    pub fn trim(&self, keep: usize) -> usize {
        let doomed: Vec<T> = {
            let mut state = self.state.lock();
            let excess = state.available.len().saturating_sub(keep);
            let removed: Vec<(PoolKey, T)> = state.available.drain(..excess).collect();
            for (key, _) in &removed {
                state.entries.remove(*key);
            }
            state.stats.destroyed += removed.len() as u64;
            removed.into_iter().map(|(_, r)| r).collect()
        };
        let count = doomed.len();
        drop(doomed);
        if count > 0 {
            log::debug!("pool '{}': trimmed {count} idle resources", self.name);
        }
        count
    }

    /// Destroys every idle and pending resource.
    ///
    /// The caller guarantees the GPU is idle. Items still checked out are
    /// untouched. Calling it again is a no-op.
    pub fn drain(&self) -> usize {
        let (available, pending) = {
            let mut state = self.state.lock();
            let available = std::mem::take(&mut state.available);
            let pending = std::mem::take(&mut state.pending);
            for (key, _) in &available {
                state.entries.remove(*key);
            }
            for item in &pending {
                state.entries.remove(item.key);
            }
            state.stats.destroyed += (available.len() + pending.len()) as u64;
            (available, pending)
        };
        let count = available.len() + pending.len();
        drop(available);
        drop(pending);
        if count > 0 {
            log::debug!("pool '{}': drained {count} resources", self.name);
        }
        count
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.entries.len(),
            in_use: state.in_use,
            pending: state.pending.len(),
            available: state.available.len(),
            ..state.stats
        }
    }

    fn construct<C>(&self, key: PoolKey, create: C) -> Result<Pooled<T>>
    where
        C: FnOnce() -> Result<T>,
    {
        match create() {
            Ok(resource) => {
                self.state.lock().stats.created += 1;
                log::debug!(
                    "pool '{}': created {:#x} ({} bytes)",
                    self.name,
                    resource.native_handle(),
                    resource.byte_size()
                );
                Ok(self.wrap(key, resource))
            }
            Err(e) => {
                self.forget(key, false);
                Err(e)
            }
        }
    }

    /// Drops the bookkeeping of a key whose checkout failed.
    fn forget(&self, key: PoolKey, destroyed: bool) {
        let mut state = self.state.lock();
        state.entries.remove(key);
        state.in_use -= 1;
        if destroyed {
            state.stats.destroyed += 1;
        }
    }

    fn wrap(&self, key: PoolKey, resource: T) -> Pooled<T> {
        Pooled { resource, key, pool_id: self.id }
    }
}

impl<T: Poolable> Reclaim for ResourcePool<T> {
    fn label(&self) -> &'static str {
        self.name
    }

    fn reclaim_completed(&self, completed: FenceValue) -> usize {
        self.reclaim(&completed)
    }

    fn drain_all(&self) -> usize {
        self.drain()
    }
}

impl<T> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("cap", &self.cap)
            .finish_non_exhaustive()
    }
}
