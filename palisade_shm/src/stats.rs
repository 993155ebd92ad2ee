//! Statistics counter rows.
//!
//! Counters live inside arena chunks of class `Stat` so external tools can
//! read them with plain loads while the process mutates them with relaxed
//! atomic increments. Rows are `#[repr(C)]` structs of `AtomicU64` only;
//! the arena zeroes payloads on allocation, which is a valid initial state
//! for every row type.

use crate::arena::{Alloc, Arena};
use crate::error::ShmResult;
use palisade::consts::VSM_CLASS_STAT;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Process-wide counters. One row per runtime, ident `""`.
#[repr(C)]
#[derive(Debug)]
pub struct MainStats {
    /// Log writes into the ring (records + batch flushes).
    pub shm_writes: AtomicU64,
    /// Individual records written (batched records count individually).
    pub shm_records: AtomicU64,
    /// Worker buffer flushes forced by overflow.
    pub shm_flushes: AtomicU64,
    /// Ring mutex contention events (trylock failed).
    pub shm_cont: AtomicU64,
    /// Ring wraparounds.
    pub shm_cycles: AtomicU64,
    /// Bytes written into the ring.
    pub shm_bytes: AtomicU64,
    /// Records silently truncated to `vsl_reclen`.
    pub vsl_trunc: AtomicU64,
    /// Live cached objects.
    pub n_object: AtomicU64,
    /// Objects retired by the expiry thread.
    pub n_expired: AtomicU64,
    /// Objects nuked for space.
    pub n_lru_nuked: AtomicU64,
    /// Successful LRU touches.
    pub n_lru_moved: AtomicU64,
    /// LRU touches skipped because the trylock failed.
    pub n_lru_limited: AtomicU64,
    /// Live backends.
    pub n_backend: AtomicU64,
    /// Live TCP pools.
    pub n_pool: AtomicU64,
    /// Fresh backend connections opened.
    pub pool_conn_opened: AtomicU64,
    /// Idle connections reused.
    pub pool_conn_reused: AtomicU64,
    /// Connections handed directly to a parked worker.
    pub pool_conn_stolen: AtomicU64,
    /// Connections closed.
    pub pool_conn_closed: AtomicU64,
    /// Workers that timed out waiting for a pool slot.
    pub pool_wait_timeout: AtomicU64,
    /// Workspace allocation failures.
    pub ws_overflow: AtomicU64,
    /// Arena allocations satisfied from the heap.
    pub vsm_bogus_alloc: AtomicU64,
}

/// Per-lock-class counters, ident = class name.
#[repr(C)]
#[derive(Debug)]
pub struct LockStats {
    /// Locks created.
    pub creat: AtomicU64,
    /// Locks destroyed.
    pub destroy: AtomicU64,
    /// Lock acquisitions.
    pub locks: AtomicU64,
    /// Condvar waits.
    pub waits: AtomicU64,
    /// Nanoseconds spent in condvar waits.
    pub wait_ns: AtomicU64,
    /// Trylock failures (contended acquisitions).
    pub contended: AtomicU64,
}

/// Per-waiter counters, ident = waiter name.
#[repr(C)]
#[derive(Debug)]
pub struct WaiterStats {
    /// File descriptors currently waited on.
    pub conns: AtomicU64,
    /// Callbacks fired with reason remote-close.
    pub remclose: AtomicU64,
    /// Callbacks fired with reason timeout.
    pub timeout: AtomicU64,
    /// Callbacks fired with reason action.
    pub action: AtomicU64,
}

/// A typed handle to a counter row living in the arena.
pub struct StatRef<T> {
    alloc: Alloc,
    _p: PhantomData<T>,
}

impl<T> Clone for StatRef<T> {
    fn clone(&self) -> Self {
        Self {
            alloc: self.alloc.clone(),
            _p: PhantomData,
        }
    }
}

unsafe impl<T: Sync> Send for StatRef<T> {}
unsafe impl<T: Sync> Sync for StatRef<T> {}

impl<T> StatRef<T> {
    /// Allocate a zeroed row of type `T` in the arena under
    /// `Stat/<typ>/<ident>`.
    pub fn new_in(arena: &Arc<Arena>, typ: &str, ident: &str) -> ShmResult<StatRef<T>> {
        let alloc = arena.alloc(std::mem::size_of::<T>(), VSM_CLASS_STAT, typ, ident)?;
        Ok(StatRef {
            alloc,
            _p: PhantomData,
        })
    }

    /// The backing allocation.
    pub fn alloc(&self) -> &Alloc {
        &self.alloc
    }
}

impl<T> std::ops::Deref for StatRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Rows are all-atomic repr(C) structs; the zeroed payload the
        // arena hands out is a valid value.
        unsafe { &*(self.alloc.as_ptr() as *const T) }
    }
}

/// Reinterpret a chunk payload as a counter row (reader side).
///
/// # Safety
/// `payload` must be at least `size_of::<T>()` bytes and 8-byte aligned,
/// which holds for any arena chunk payload.
pub unsafe fn row_from_payload<T>(payload: &[u8]) -> Option<&T> {
    if payload.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { &*(payload.as_ptr() as *const T) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_row_allocation_and_counting() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 64 * 1024, 60.0).unwrap();

        let main: StatRef<MainStats> = StatRef::new_in(&arena, "main", "").unwrap();
        assert_eq!(main.shm_writes.load(Ordering::Relaxed), 0);
        main.shm_writes.fetch_add(3, Ordering::Relaxed);
        assert_eq!(main.shm_writes.load(Ordering::Relaxed), 3);

        let lck: StatRef<LockStats> = StatRef::new_in(&arena, "lock", "lru").unwrap();
        lck.creat.fetch_add(1, Ordering::Relaxed);
        assert_eq!(lck.creat.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_clone_shares_row() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 64 * 1024, 60.0).unwrap();
        let a: StatRef<WaiterStats> = StatRef::new_in(&arena, "waiter", "epoll").unwrap();
        let b = a.clone();
        a.conns.fetch_add(2, Ordering::Relaxed);
        assert_eq!(b.conns.load(Ordering::Relaxed), 2);
    }
}
