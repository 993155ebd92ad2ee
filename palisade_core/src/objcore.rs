//! Object cores and LRU lists.
//!
//! An [`ObjCore`] is the cache-side handle to a stored response: a stable
//! digest, timing, a reference count and the bookkeeping both eviction
//! indexes need. Any live object is on exactly one LRU and in the timer
//! heap, and the expiry engine holds one reference for the pair.
//!
//! The LRU is a slab-linked list: nodes live in a vector, objects carry
//! their slot index, and link surgery is O(1) without unsafe pointer
//! chasing. Lock order is `Lru.mtx` before the timer mutex.

use crate::heap::{HeapItem, NOIDX};
use crate::sync::{LockClass, Mtx};
use bitflags::bitflags;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

bitflags! {
    /// Object-core flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OcFlags: u32 {
        /// Do not move on LRU touch (persistent-segment objects).
        const LRU_DONT_MOVE = 1 << 0;
        /// Being retired; still reachable by in-flight requests.
        const DYING = 1 << 1;
    }
}

/// Slot value meaning "not on any LRU".
pub const NOSLOT: u32 = u32::MAX;

#[inline]
fn f2b(v: f64) -> u64 {
    v.to_bits()
}

#[inline]
fn b2f(b: u64) -> f64 {
    f64::from_bits(b)
}

/// Cache-side handle to a stored object.
pub struct ObjCore {
    /// Cache digest of the object's key.
    pub digest: [u8; 32],
    /// Transaction that inserted the object.
    pub xid: u64,
    /// Insertion time.
    pub entered: f64,
    /// Id of the LRU this object belongs to.
    pub lru_id: u32,

    ttl: AtomicU64,
    grace: AtomicU64,
    timer_when: AtomicU64,
    refcnt: AtomicU32,
    flags: AtomicU32,
    heap_idx: AtomicU32,
    lru_slot: AtomicU32,
}

impl ObjCore {
    /// Create an object core with one reference (the creator's).
    pub fn new(
        digest: [u8; 32],
        xid: u64,
        entered: f64,
        ttl: f64,
        grace: f64,
        lru_id: u32,
    ) -> Arc<ObjCore> {
        assert!(entered.is_finite());
        Arc::new(ObjCore {
            digest,
            xid,
            entered,
            lru_id,
            ttl: AtomicU64::new(f2b(ttl)),
            grace: AtomicU64::new(f2b(grace)),
            timer_when: AtomicU64::new(f2b(0.0)),
            refcnt: AtomicU32::new(1),
            flags: AtomicU32::new(0),
            heap_idx: AtomicU32::new(NOIDX),
            lru_slot: AtomicU32::new(NOSLOT),
        })
    }

    /// Time-to-live in seconds; non-positive means "unset".
    pub fn ttl(&self) -> f64 {
        b2f(self.ttl.load(Ordering::Relaxed))
    }

    /// Change the TTL. The caller must rearm the timer afterwards.
    pub fn set_ttl(&self, v: f64) {
        self.ttl.store(f2b(v), Ordering::Relaxed);
    }

    /// Grace in seconds; non-positive means "use the default".
    pub fn grace(&self) -> f64 {
        b2f(self.grace.load(Ordering::Relaxed))
    }

    /// Change the grace. The caller must rearm the timer afterwards.
    pub fn set_grace(&self, v: f64) {
        self.grace.store(f2b(v), Ordering::Relaxed);
    }

    /// Absolute fire time of the expiry timer.
    pub fn timer_when(&self) -> f64 {
        b2f(self.timer_when.load(Ordering::Relaxed))
    }

    pub(crate) fn set_timer_when(&self, v: f64) {
        assert!(!v.is_nan());
        self.timer_when.store(f2b(v), Ordering::Relaxed);
    }

    /// Current reference count.
    pub fn refs(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Take a reference.
    pub fn get_ref(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference; returns the remaining count.
    pub fn put_ref(&self) -> u32 {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "objcore refcount underflow");
        prev - 1
    }

    /// Current flags.
    pub fn flags(&self) -> OcFlags {
        OcFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Set flags.
    pub fn set_flags(&self, f: OcFlags) {
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }

    /// Clear flags.
    pub fn clear_flags(&self, f: OcFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed);
    }

    /// Slot on the owning LRU, [`NOSLOT`] when off-list.
    pub fn lru_slot(&self) -> u32 {
        self.lru_slot.load(Ordering::Relaxed)
    }

    /// True while the object is in the timer heap.
    pub fn in_heap(&self) -> bool {
        self.heap_idx.load(Ordering::Relaxed) != NOIDX
    }
}

impl HeapItem for Arc<ObjCore> {
    fn heap_key(&self) -> f64 {
        self.timer_when()
    }
    fn heap_idx(&self) -> u32 {
        self.heap_idx.load(Ordering::Relaxed)
    }
    fn set_heap_idx(&self, idx: u32) {
        self.heap_idx.store(idx, Ordering::Relaxed);
    }
}

struct LruNode {
    prev: u32,
    next: u32,
    oc: Option<Arc<ObjCore>>,
}

/// The list body, accessed under `Lru::mtx`.
pub struct LruList {
    nodes: Vec<LruNode>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl LruList {
    fn new() -> LruList {
        LruList {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NOSLOT,
            tail: NOSLOT,
            len: 0,
        }
    }

    /// Entries on the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn new_node(&mut self, oc: Arc<ObjCore>) -> u32 {
        match self.free.pop() {
            Some(slot) => {
                let n = &mut self.nodes[slot as usize];
                n.prev = NOSLOT;
                n.next = NOSLOT;
                n.oc = Some(oc);
                slot
            }
            None => {
                self.nodes.push(LruNode {
                    prev: NOSLOT,
                    next: NOSLOT,
                    oc: Some(oc),
                });
                (self.nodes.len() - 1) as u32
            }
        }
    }

    /// Append an object at the tail (most recently used end).
    pub fn push_tail(&mut self, oc: &Arc<ObjCore>) {
        assert_eq!(oc.lru_slot(), NOSLOT, "object already on an LRU");
        let slot = self.new_node(Arc::clone(oc));
        let n = slot as usize;
        self.nodes[n].prev = self.tail;
        if self.tail != NOSLOT {
            self.nodes[self.tail as usize].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
        oc.lru_slot.store(slot, Ordering::Relaxed);
    }

    /// Unlink an object; returns false if it was not on this list.
    pub fn unlink(&mut self, oc: &ObjCore) -> bool {
        let slot = oc.lru_slot();
        if slot == NOSLOT {
            return false;
        }
        let (prev, next) = {
            let n = &self.nodes[slot as usize];
            assert!(
                n.oc.as_deref().is_some_and(|o| std::ptr::eq(o, oc)),
                "LRU slot does not hold this object"
            );
            (n.prev, n.next)
        };
        if prev != NOSLOT {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NOSLOT {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let n = &mut self.nodes[slot as usize];
        n.oc = None;
        n.prev = NOSLOT;
        n.next = NOSLOT;
        self.free.push(slot);
        self.len -= 1;
        oc.lru_slot.store(NOSLOT, Ordering::Relaxed);
        true
    }

    /// Move an object to the tail; no-op if it is not on this list.
    pub fn move_to_tail(&mut self, oc: &Arc<ObjCore>) -> bool {
        if oc.lru_slot() == NOSLOT {
            return false;
        }
        if !self.unlink(oc) {
            return false;
        }
        self.push_tail(oc);
        true
    }

    /// Walk from the head (least recently used) and return the first
    /// object matching `pred`.
    pub fn find_from_head<F: FnMut(&Arc<ObjCore>) -> bool>(
        &self,
        mut pred: F,
    ) -> Option<Arc<ObjCore>> {
        let mut slot = self.head;
        while slot != NOSLOT {
            let n = &self.nodes[slot as usize];
            let oc = n.oc.as_ref().expect("linked node holds an object");
            if pred(oc) {
                return Some(Arc::clone(oc));
            }
            slot = n.next;
        }
        None
    }

    /// The least recently used object, if any.
    pub fn head(&self) -> Option<Arc<ObjCore>> {
        self.find_from_head(|_| true)
    }
}

/// An LRU list with its own mutex. A storage class owns one; the runtime
/// supports any number.
pub struct Lru {
    /// Identifier, assigned by the expiry engine.
    pub id: u32,
    /// The list, under its own lock. Lock order: this before the timer.
    pub mtx: Mtx<LruList>,
}

impl Lru {
    /// Create an LRU with the given lock class.
    pub fn new(id: u32, class: Arc<LockClass>) -> Arc<Lru> {
        Arc::new(Lru {
            id,
            mtx: Mtx::new(class, LruList::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_shm::Arena;

    fn mk_lru() -> (tempfile::TempDir, Arc<Lru>) {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 64 * 1024, 60.0).unwrap();
        let class = LockClass::new(&arena, "lru").unwrap();
        (dir, Lru::new(0, class))
    }

    fn oc(xid: u64) -> Arc<ObjCore> {
        ObjCore::new([0; 32], xid, 1000.0, 60.0, 10.0, 0)
    }

    #[test]
    fn test_push_unlink() {
        let (_d, lru) = mk_lru();
        let a = oc(1);
        let b = oc(2);
        let mut g = lru.mtx.lock();
        g.push_tail(&a);
        g.push_tail(&b);
        assert_eq!(g.len(), 2);
        assert_eq!(g.head().unwrap().xid, 1);
        assert!(g.unlink(&a));
        assert_eq!(g.head().unwrap().xid, 2);
        assert_eq!(a.lru_slot(), NOSLOT);
        assert!(!g.unlink(&a));
    }

    #[test]
    fn test_move_to_tail_changes_order() {
        let (_d, lru) = mk_lru();
        let a = oc(1);
        let b = oc(2);
        let c = oc(3);
        let mut g = lru.mtx.lock();
        g.push_tail(&a);
        g.push_tail(&b);
        g.push_tail(&c);
        assert!(g.move_to_tail(&a));
        // b is now least recently used.
        assert_eq!(g.head().unwrap().xid, 2);
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn test_slot_reuse() {
        let (_d, lru) = mk_lru();
        let mut g = lru.mtx.lock();
        let a = oc(1);
        g.push_tail(&a);
        g.unlink(&a);
        let b = oc(2);
        g.push_tail(&b);
        // The freed slot was recycled.
        assert_eq!(b.lru_slot(), 0);
    }

    #[test]
    fn test_refcounting() {
        let a = oc(1);
        assert_eq!(a.refs(), 1);
        assert_eq!(a.get_ref(), 2);
        assert_eq!(a.put_ref(), 1);
        assert_eq!(a.put_ref(), 0);
    }

    #[test]
    fn test_flags() {
        let a = oc(1);
        assert!(!a.flags().contains(OcFlags::LRU_DONT_MOVE));
        a.set_flags(OcFlags::LRU_DONT_MOVE);
        assert!(a.flags().contains(OcFlags::LRU_DONT_MOVE));
        a.clear_flags(OcFlags::LRU_DONT_MOVE);
        assert!(!a.flags().contains(OcFlags::LRU_DONT_MOVE));
    }
}
