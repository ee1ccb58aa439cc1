//! Resource Pool Tests
//!
//! Tests for:
//! - ResourcePool: acquire / release / reclaim cycle, most-recent reuse
//! - Cap enforcement: PoolExhausted, eviction of idle items
//! - Fence gating: no reuse before the release fence completes
//! - Drain: idempotent, never resurrects pre-drain items
//! - Handle checks: foreign handles
//! - Graveyard: deferred destruction in fence order

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use cadence::{CadenceError, ErrorKind, Graveyard, Poolable, ResourcePool, Result};

// ============================================================================
// Test Resource
// ============================================================================

/// Counts creations, resets and destructions through a shared tracker.
#[derive(Default)]
struct Tracker {
    next_handle: AtomicU64,
    resets: AtomicUsize,
    dropped: AtomicUsize,
}

#[derive(Debug)]
struct Allocator {
    handle: u64,
    len: u64,
    tracker: Arc<Tracker>,
}

impl Poolable for Allocator {
    fn reset(&mut self) -> Result<()> {
        self.tracker.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn native_handle(&self) -> u64 {
        self.handle
    }

    fn byte_size(&self) -> u64 {
        self.len
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.tracker.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Tracker")
    }
}

fn make(tracker: &Arc<Tracker>, len: u64) -> impl FnOnce() -> Result<Allocator> + '_ {
    move || {
        Ok(Allocator {
            handle: tracker.next_handle.fetch_add(1, Ordering::Relaxed) + 1,
            len,
            tracker: Arc::clone(tracker),
        })
    }
}

fn setup(cap: usize) -> (ResourcePool<Allocator>, Arc<Tracker>) {
    let _ = env_logger::builder().is_test(true).try_init();
    (ResourcePool::new("test allocators", cap), Arc::new(Tracker::default()))
}

// ============================================================================
// Acquire / Release
// ============================================================================

#[test]
fn empty_pool_creates_on_first_acquire() {
    let (pool, tracker) = setup(4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_eq!(item.native_handle(), 1);

    let stats = pool.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.live, 1);
}

#[test]
fn released_item_is_reused_after_its_fence_completes() {
    let (pool, tracker) = setup(4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let handle = item.native_handle();
    pool.release(item, 3).unwrap();

    let again = pool.acquire(&3_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_eq!(again.native_handle(), handle);
    assert_eq!(tracker.resets.load(Ordering::Relaxed), 1);
    assert_eq!(pool.stats().hits, 1);
}

#[test]
fn release_does_not_reclaim_immediately() {
    let (pool, tracker) = setup(4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    pool.release(item, 1).unwrap();

    let stats = pool.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.available, 0);
}

#[test]
fn incomplete_fence_blocks_reuse() {
    let (pool, tracker) = setup(4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let first = item.native_handle();
    pool.release(item, 5).unwrap();

    let other = pool.acquire(&4_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_ne!(other.native_handle(), first);
    assert_eq!(pool.stats().pending, 1);
}

#[test]
fn most_recently_released_item_is_preferred() {
    let (pool, tracker) = setup(4);
    let a = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b_handle = b.native_handle();
    pool.release(a, 1).unwrap();
    pool.release(b, 2).unwrap();

    let reused = pool.acquire(&2_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_eq!(reused.native_handle(), b_handle);
}

#[test]
fn predicate_filters_candidates() {
    let (pool, tracker) = setup(4);
    let small = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let large = pool.acquire(&0_u64, |_| true, make(&tracker, 4096)).unwrap();
    let large_handle = large.native_handle();
    pool.release(large, 1).unwrap();
    pool.release(small, 1).unwrap();

    let picked = pool.acquire(&1_u64, |a| a.byte_size() >= 1024, make(&tracker, 1024)).unwrap();
    assert_eq!(picked.native_handle(), large_handle);
}

// ============================================================================
// Retirement Order
// ============================================================================

#[test]
fn reclaim_moves_exactly_the_completed_prefix() {
    let (pool, tracker) = setup(8);
    let items: Vec<_> = (0..5).map(|_| pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap()).collect();
    for (i, item) in items.into_iter().enumerate() {
        pool.release(item, i as u64 + 1).unwrap();
    }

    assert_eq!(pool.reclaim(&3_u64), 3);
    let stats = pool.stats();
    assert_eq!(stats.available, 3);
    assert_eq!(stats.pending, 2);

    assert_eq!(pool.reclaim(&3_u64), 0);
    assert_eq!(pool.reclaim(&10_u64), 2);
    assert_eq!(pool.stats().pending, 0);
}

#[test]
fn reclaim_stops_at_the_first_incomplete_item() {
    let (pool, tracker) = setup(4);
    let a = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    pool.release(a, 7).unwrap();
    pool.release(b, 2).unwrap();

    // FIFO order: the item at 7 holds back the item at 2.
    assert_eq!(pool.reclaim(&5_u64), 0);
    assert_eq!(pool.reclaim(&7_u64), 2);
}

// ============================================================================
// Cap Enforcement
// ============================================================================

#[test]
fn fifth_acquire_at_cap_four_is_exhausted() {
    let (pool, tracker) = setup(4);
    let held: Vec<_> = (0..4).map(|_| pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap()).collect();

    let err = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap_err();
    assert_eq!(err, CadenceError::PoolExhausted { pool: "test allocators", live: 4, cap: 4 });
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
    assert!(err.is_recoverable());

    let stats = pool.stats();
    assert_eq!(stats.created, 4);
    assert_eq!(stats.exhausted, 1);
    drop(held);
}

#[test]
fn pending_items_still_count_against_the_cap() {
    let (pool, tracker) = setup(2);
    let a = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    pool.release(a, 1).unwrap();
    pool.release(b, 2).unwrap();

    assert!(pool.acquire(&0_u64, |_| true, make(&tracker, 64)).is_err());
    assert!(pool.acquire(&1_u64, |_| true, make(&tracker, 64)).is_ok());
}

#[test]
fn idle_non_matching_item_is_evicted_at_cap() {
    let (pool, tracker) = setup(2);
    let a = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    pool.release(a, 1).unwrap();

    let big = pool.acquire(&1_u64, |r| r.byte_size() >= 4096, make(&tracker, 4096)).unwrap();
    assert_eq!(big.byte_size(), 4096);
    assert_eq!(tracker.dropped.load(Ordering::Relaxed), 1);

    let stats = pool.stats();
    assert_eq!(stats.live, 2);
    assert_eq!(stats.destroyed, 1);
    drop((b, big));
}

#[test]
fn failed_creation_frees_its_slot() {
    let (pool, _tracker) = setup(1);
    let err = pool
        .acquire(&0_u64, |_| true, || Err(CadenceError::Backend("out of memory".into())))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);

    let stats = pool.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.in_use, 0);
}

// ============================================================================
// Discard / Trim / Drain
// ============================================================================

#[test]
fn discard_destroys_instead_of_recycling() {
    let (pool, tracker) = setup(4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    pool.discard(item).unwrap();

    assert_eq!(tracker.dropped.load(Ordering::Relaxed), 1);
    let stats = pool.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.destroyed, 1);
}

#[test]
fn trim_keeps_the_newest_idle_items() {
    let (pool, tracker) = setup(8);
    let items: Vec<_> = (0..4).map(|_| pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap()).collect();
    let handles: Vec<u64> = items.iter().map(|i| i.native_handle()).collect();
    for item in items {
        pool.release(item, 1).unwrap();
    }
    pool.reclaim(&1_u64);

    assert_eq!(pool.trim(1), 3);
    let survivor = pool.acquire(&1_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_eq!(survivor.native_handle(), handles[3]);
}

#[test]
fn drain_destroys_idle_and_pending_items() {
    let (pool, tracker) = setup(4);
    let a = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    pool.release(a, 1).unwrap();
    pool.release(b, 9).unwrap();
    pool.reclaim(&1_u64);

    assert_eq!(pool.drain(), 2);
    assert_eq!(tracker.dropped.load(Ordering::Relaxed), 2);
    assert_eq!(pool.stats().live, 0);
}

#[test]
fn drain_is_idempotent_and_never_resurrects_items() {
    let (pool, tracker) = setup(4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let old = item.native_handle();
    pool.release(item, 1).unwrap();

    assert_eq!(pool.drain(), 1);
    assert_eq!(pool.drain(), 0);

    let fresh = pool.acquire(&100_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_ne!(fresh.native_handle(), old);
    assert_eq!(pool.stats().created, 2);
}

#[test]
fn drain_leaves_checked_out_items_alone() {
    let (pool, tracker) = setup(4);
    let held = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_eq!(pool.drain(), 0);
    pool.release(held, 1).unwrap();
    assert_eq!(pool.stats().pending, 1);
}

// ============================================================================
// Handle Checks
// ============================================================================

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "misuse"))]
fn releasing_into_another_pool_is_refused() {
    let (pool, tracker) = setup(4);
    let other: ResourcePool<Allocator> = ResourcePool::new("other", 4);
    let item = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();

    let err = other.release(item, 1).unwrap_err();
    assert_eq!(err, CadenceError::ForeignHandle { pool: "other" });
    assert_eq!(other.stats().pending, 0);
}

#[test]
fn pool_handles_expose_their_origin() {
    let (pool, tracker) = setup(4);
    let other: ResourcePool<Allocator> = ResourcePool::new("other", 4);
    let a = pool.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    let b = other.acquire(&0_u64, |_| true, make(&tracker, 64)).unwrap();
    assert_ne!(a.pool_id(), b.pool_id());
}

// ============================================================================
// Graveyard
// ============================================================================

#[test]
fn graveyard_drops_resources_in_fence_order() {
    let tracker = Arc::new(Tracker::default());
    let graveyard = Graveyard::new();
    graveyard.bury(1, make(&tracker, 1)().unwrap());
    graveyard.bury(2, make(&tracker, 1)().unwrap());
    graveyard.bury(4, make(&tracker, 1)().unwrap());

    assert_eq!(graveyard.collect(0), 0);
    assert_eq!(graveyard.collect(2), 2);
    assert_eq!(tracker.dropped.load(Ordering::Relaxed), 2);
    assert_eq!(graveyard.len(), 1);

    assert_eq!(graveyard.drain(), 1);
    assert!(graveyard.is_empty());
    assert_eq!(tracker.dropped.load(Ordering::Relaxed), 3);
}
