//! Counted lock primitives.
//!
//! Every mutex, condvar and rwlock in the runtime belongs to a
//! [`LockClass`] whose counter row lives in the arena, so lock traffic and
//! contention are visible to external tools without any sampling hooks.
//!
//! The wrappers also enforce two invariants, not as hints but as panics:
//! a thread may not take the same mutex twice, and only the owning thread
//! may unlock. Violations are programming errors, and the panic dump makes
//! them debuggable post-mortem.

use palisade_shm::{Arena, LockStats, StatRef};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

static THREAD_SEQ: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_IDENT: usize = THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
}

/// Small process-local integer identifying the current thread.
#[inline]
pub fn thread_ident() -> usize {
    THREAD_IDENT.with(|t| *t)
}

/// A named class of locks sharing one counter row.
pub struct LockClass {
    name: &'static str,
    stats: StatRef<LockStats>,
}

impl LockClass {
    /// Create the class and its arena counter row.
    pub fn new(arena: &Arc<Arena>, name: &'static str) -> palisade_shm::ShmResult<Arc<LockClass>> {
        let stats = StatRef::new_in(arena, "lock", name)?;
        Ok(Arc::new(LockClass { name, stats }))
    }

    /// Class name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The counter row.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

/// A counted mutex.
pub struct Mtx<T> {
    class: Arc<LockClass>,
    owner: AtomicUsize, // thread_ident of the holder, 0 when unheld
    inner: parking_lot::Mutex<T>,
}

impl<T> Mtx<T> {
    /// Create a mutex in `class`.
    pub fn new(class: Arc<LockClass>, value: T) -> Mtx<T> {
        class.stats.creat.fetch_add(1, Ordering::Relaxed);
        Mtx {
            class,
            owner: AtomicUsize::new(0),
            inner: parking_lot::Mutex::new(value),
        }
    }

    #[inline]
    fn assert_not_held_by_me(&self) {
        let me = thread_ident();
        assert!(
            self.owner.load(Ordering::Relaxed) != me,
            "lock {} taken recursively",
            self.class.name
        );
    }

    /// Lock, counting contention when the uncontended path fails.
    pub fn lock(&self) -> MtxGuard<'_, T> {
        self.assert_not_held_by_me();
        let guard = match self.inner.try_lock() {
            Some(g) => g,
            None => {
                self.class.stats.contended.fetch_add(1, Ordering::Relaxed);
                self.inner.lock()
            }
        };
        self.class.stats.locks.fetch_add(1, Ordering::Relaxed);
        self.owner.store(thread_ident(), Ordering::Relaxed);
        MtxGuard {
            mtx: self,
            guard: Some(guard),
        }
    }

    /// Try to lock; failure is a counted, legal outcome.
    pub fn try_lock(&self) -> Option<MtxGuard<'_, T>> {
        self.assert_not_held_by_me();
        match self.inner.try_lock() {
            Some(g) => {
                self.class.stats.locks.fetch_add(1, Ordering::Relaxed);
                self.owner.store(thread_ident(), Ordering::Relaxed);
                Some(MtxGuard {
                    mtx: self,
                    guard: Some(g),
                })
            }
            None => {
                self.class.stats.contended.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl<T> Drop for Mtx<T> {
    fn drop(&mut self) {
        self.class.stats.destroy.fetch_add(1, Ordering::Relaxed);
    }
}

/// Guard for a [`Mtx`].
pub struct MtxGuard<'a, T> {
    mtx: &'a Mtx<T>,
    guard: Option<parking_lot::MutexGuard<'a, T>>,
}

impl<'a, T> MtxGuard<'a, T> {
    fn inner_mut(&mut self) -> &mut parking_lot::MutexGuard<'a, T> {
        self.guard.as_mut().expect("guard taken")
    }
}

impl<T> std::ops::Deref for MtxGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard taken")
    }
}

impl<T> std::ops::DerefMut for MtxGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard taken")
    }
}

impl<T> Drop for MtxGuard<'_, T> {
    fn drop(&mut self) {
        let me = thread_ident();
        assert_eq!(
            self.mtx.owner.load(Ordering::Relaxed),
            me,
            "lock {} unlocked by non-owner",
            self.mtx.class.name
        );
        self.mtx.owner.store(0, Ordering::Relaxed);
        self.guard.take();
    }
}

/// A counted condition variable. Pairs with [`Mtx`] of the same class.
pub struct Cond {
    class: Arc<LockClass>,
    inner: parking_lot::Condvar,
}

impl Cond {
    /// Create a condvar in `class`.
    pub fn new(class: Arc<LockClass>) -> Cond {
        Cond {
            class,
            inner: parking_lot::Condvar::new(),
        }
    }

    /// Wait on the condvar, releasing and reacquiring the guard's mutex.
    pub fn wait<T>(&self, guard: &mut MtxGuard<'_, T>) {
        let me = thread_ident();
        self.class.stats.waits.fetch_add(1, Ordering::Relaxed);
        let t0 = Instant::now();
        guard.mtx.owner.store(0, Ordering::Relaxed);
        self.inner.wait(guard.inner_mut());
        guard.mtx.owner.store(me, Ordering::Relaxed);
        self.class
            .stats
            .wait_ns
            .fetch_add(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Wait with a timeout; returns true if the wait timed out.
    pub fn wait_for<T>(&self, guard: &mut MtxGuard<'_, T>, timeout: Duration) -> bool {
        let me = thread_ident();
        self.class.stats.waits.fetch_add(1, Ordering::Relaxed);
        let t0 = Instant::now();
        guard.mtx.owner.store(0, Ordering::Relaxed);
        let result = self.inner.wait_for(guard.inner_mut(), timeout);
        guard.mtx.owner.store(me, Ordering::Relaxed);
        self.class
            .stats
            .wait_ns
            .fetch_add(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
        result.timed_out()
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    /// Wake all waiters.
    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

/// A counted reader-writer lock. Directors take it shared on `resolve`
/// and exclusive on reconfiguration; only acquisitions are counted.
pub struct Rw<T> {
    class: Arc<LockClass>,
    inner: parking_lot::RwLock<T>,
}

impl<T> Rw<T> {
    /// Create a rwlock in `class`.
    pub fn new(class: Arc<LockClass>, value: T) -> Rw<T> {
        class.stats.creat.fetch_add(1, Ordering::Relaxed);
        Rw {
            class,
            inner: parking_lot::RwLock::new(value),
        }
    }

    /// Shared lock.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, T> {
        self.class.stats.locks.fetch_add(1, Ordering::Relaxed);
        self.inner.read()
    }

    /// Exclusive lock.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, T> {
        self.class.stats.locks.fetch_add(1, Ordering::Relaxed);
        self.inner.write()
    }
}

impl<T> Drop for Rw<T> {
    fn drop(&mut self) {
        self.class.stats.destroy.fetch_add(1, Ordering::Relaxed);
    }
}
