//! Object expiry.
//!
//! Two indexes cover the same object set: one process-wide binary heap
//! keyed on fire time, and per-storage LRU lists. Every live object is in
//! both, and the engine holds one object reference for the pair.
//!
//! Lock order is `lru.mtx` before `timer`. The hang-man thread walks the
//! other way around and therefore only ever trylocks the LRU, restarting
//! when it loses the race.

use crate::error::{CoreError, CoreResult};
use crate::heap::{BinHeap, HeapItem};
use crate::objcore::{Lru, ObjCore, OcFlags};
use crate::sync::{LockClass, Mtx};
use palisade::vtim;
use palisade_shm::{Arena, MainStats, StatRef, Vsl, VslTag};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Per-session bounds that may shrink an object's effective ttl/grace.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessExp {
    /// Session TTL bound; non-positive means unset.
    pub ttl: f64,
    /// Session grace bound; non-positive means unset.
    pub grace: f64,
}

type TickFn = Box<dyn Fn(f64) + Send>;

/// The expiry engine. One per runtime.
pub struct ExpiryEngine {
    timer: Mtx<BinHeap<Arc<ObjCore>>>,
    lrus: parking_lot::Mutex<Vec<Arc<Lru>>>,
    lru_class: Arc<LockClass>,
    stats: StatRef<MainStats>,
    vsl: Arc<Vsl>,
    arena: Arc<Arena>,
    default_grace: f64,
    expiry_sleep: f64,
    die: Arc<AtomicBool>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
    ticks: parking_lot::Mutex<Vec<TickFn>>,
}

impl ExpiryEngine {
    /// Build the engine. Call [`ExpiryEngine::start`] to run the hang-man.
    pub fn new(
        arena: &Arc<Arena>,
        stats: StatRef<MainStats>,
        vsl: Arc<Vsl>,
        timer_class: Arc<LockClass>,
        lru_class: Arc<LockClass>,
        default_grace: f64,
        expiry_sleep: f64,
    ) -> Arc<ExpiryEngine> {
        Arc::new(ExpiryEngine {
            timer: Mtx::new(timer_class, BinHeap::new()),
            lrus: parking_lot::Mutex::new(Vec::new()),
            lru_class,
            stats,
            vsl,
            arena: Arc::clone(arena),
            default_grace,
            expiry_sleep,
            die: Arc::new(AtomicBool::new(false)),
            thread: parking_lot::Mutex::new(None),
            ticks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Create a new LRU list (e.g. one per storage class).
    pub fn new_lru(&self) -> Arc<Lru> {
        let mut lrus = self.lrus.lock();
        let lru = Lru::new(lrus.len() as u32, Arc::clone(&self.lru_class));
        lrus.push(Arc::clone(&lru));
        lru
    }

    fn lru_by_id(&self, id: u32) -> Option<Arc<Lru>> {
        self.lrus.lock().get(id as usize).cloned()
    }

    /// Register work for the hang-man's idle tick (cooling sweeps etc).
    pub fn on_tick(&self, f: TickFn) {
        self.ticks.lock().push(f);
    }

    /// When the timer fires for this object, under optional session bounds.
    pub fn fire_time(&self, oc: &ObjCore, sess: Option<&SessExp>) -> f64 {
        let mut ttl = oc.ttl().max(0.0);
        let mut grace = if oc.grace() > 0.0 {
            oc.grace()
        } else {
            self.default_grace
        };
        if let Some(s) = sess {
            if s.ttl > 0.0 && s.ttl < ttl {
                ttl = s.ttl;
            }
            if s.grace > 0.0 && s.grace < grace {
                grace = s.grace;
            }
        }
        let when = oc.entered + ttl + grace;
        assert!(!when.is_nan());
        when
    }

    /// Record a freshly inserted object in both indexes. The engine takes
    /// its own reference.
    pub fn insert(&self, oc: &Arc<ObjCore>, lru: &Lru, sess: Option<&SessExp>) {
        assert_eq!(oc.lru_id, lru.id, "object inserted on foreign LRU");
        oc.get_ref();
        let when = self.fire_time(oc, sess);
        let mut lg = lru.mtx.lock();
        {
            let mut timer = self.timer.lock();
            oc.set_timer_when(when);
            assert!(!oc.in_heap());
            timer.insert(Arc::clone(oc));
            assert!(oc.in_heap());
            lg.push_tail(oc);
        }
        drop(lg);
        self.stats.n_object.fetch_add(1, Ordering::Relaxed);
    }

    /// Move a hit object towards the tail of its LRU. Best-effort: a
    /// failed trylock is a legal no-op and keeps the hit path wait-free.
    pub fn touch(&self, oc: &Arc<ObjCore>, lru: &Lru) -> bool {
        if oc.flags().contains(OcFlags::LRU_DONT_MOVE) {
            return false;
        }
        let Some(mut lg) = lru.mtx.try_lock() else {
            self.stats.n_lru_limited.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        // The locking order is LRU then timer, so the heap index can be
        // trusted here without the timer lock.
        if oc.in_heap() && lg.move_to_tail(oc) {
            self.stats.n_lru_moved.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Recompute the fire time after a ttl/grace change and reshuffle the
    /// heap. Objects the hang-man has already unhooked are left alone.
    pub fn rearm(&self, oc: &Arc<ObjCore>, lru: &Lru, sess: Option<&SessExp>) {
        let lg = lru.mtx.lock();
        let mut timer = self.timer.lock();
        if oc.in_heap() {
            let when = self.fire_time(oc, sess);
            if when != oc.timer_when() {
                oc.set_timer_when(when);
                timer.reorder(oc.heap_idx());
            }
        }
        drop(timer);
        drop(lg);
    }

    /// Attempt to free space by retiring the oldest unreferenced object
    /// on `lru`. Mutates nothing when every candidate is referenced.
    pub fn nuke_one(&self, lru: &Lru) -> CoreResult<Arc<ObjCore>> {
        let mut lg = lru.mtx.lock();
        let mut timer = self.timer.lock();
        // The engine's own reference is the 1; anything above means a
        // request is using the object and nuking it frees nothing.
        let victim = lg.find_from_head(|oc| oc.refs() == 1);
        let Some(oc) = victim else {
            drop(timer);
            drop(lg);
            return Err(CoreError::CannotMakeSpace);
        };
        assert!(oc.in_heap());
        lg.unlink(&oc);
        timer.delete(oc.heap_idx());
        assert!(!oc.in_heap());
        drop(timer);
        drop(lg);

        self.stats.n_lru_nuked.fetch_add(1, Ordering::Relaxed);
        self.stats.n_object.fetch_sub(1, Ordering::Relaxed);
        self.vsl
            .log(VslTag::ExpKill, oc.xid, format!("{} LRU", oc.xid).as_bytes());
        oc.set_flags(OcFlags::DYING);
        oc.put_ref();
        Ok(oc)
    }

    /// Objects currently tracked, for tests and introspection.
    pub fn tracked(&self) -> usize {
        self.timer.lock().len()
    }

    /// Fire time of the heap root, if any.
    pub fn next_fire(&self) -> Option<f64> {
        self.timer.lock().root().map(|oc| oc.timer_when())
    }

    /// Start the hang-man thread.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cache-timeout".to_string())
            .spawn(move || me.hangman())
            .expect("spawn expiry thread");
        *self.thread.lock() = Some(handle);
    }

    /// Stop the hang-man and wait for it.
    pub fn shutdown(&self) {
        self.die.store(true, Ordering::Release);
        if let Some(h) = self.thread.lock().take() {
            let _ = h.join();
        }
    }

    /// The hang-man: sample the heap root, sleep until it is due, then
    /// retire it. A concurrent deletion or a lost LRU trylock restarts
    /// the loop.
    fn hangman(self: Arc<Self>) {
        let mut t = vtim::real_now();
        let mut busy = false;
        loop {
            if !busy {
                if self.die.load(Ordering::Acquire) {
                    break;
                }
                self.arena.bump_age();
                for f in self.ticks.lock().iter() {
                    f(t);
                }
                vtim::sleep(self.expiry_sleep);
                t = vtim::real_now();
            }
            busy = false;

            let timer = self.timer.lock();
            let Some(oc) = timer.root().cloned() else {
                continue;
            };

            // We may have expired so many objects that the timestamp went
            // stale; refresh before trusting it.
            if oc.timer_when() > t {
                t = vtim::real_now();
            }
            if oc.timer_when() > t {
                continue;
            }

            // Due. The correct order is LRU before timer, so trylock the
            // LRU and punt to the next round if somebody holds it.
            let Some(lru) = self.lru_by_id(oc.lru_id) else {
                continue;
            };
            let Some(mut lg) = lru.mtx.try_lock() else {
                continue;
            };

            let mut timer = timer;
            assert!(oc.in_heap());
            timer.delete(oc.heap_idx());
            assert!(!oc.in_heap());
            lg.unlink(&oc);
            drop(timer);
            drop(lg);

            self.stats.n_expired.fetch_add(1, Ordering::Relaxed);
            self.stats.n_object.fetch_sub(1, Ordering::Relaxed);
            self.vsl
                .log(VslTag::ExpKill, oc.xid, format!("{} TTL", oc.xid).as_bytes());
            oc.set_flags(OcFlags::DYING);
            oc.put_ref();
            busy = true;
        }
        tracing::info!("expiry thread drained");
    }
}
