//! The shared-memory arena.
//!
//! One file-backed region holding a head, then a linked list of chunks,
//! each tagged with a class, a type and an ident so out-of-process readers
//! can enumerate everything the process publishes. Readers never take a
//! lock; the writer brackets every list mutation with the allocator
//! generation (`alloc_seq`): it is zeroed before the mutation and set to a
//! fresh non-zero value after, with release fences in between. A reader
//! that observes zero, or a changed value, re-scans.
//!
//! Allocation is best-fit from a size-sorted free list. When the arena is
//! full the allocation is satisfied from the process heap instead
//! ("bogus"); the caller keeps running, external visibility of that one
//! chunk is lost. Freed ranges cool for [`Params::cool_duration`] seconds
//! before they become allocatable again, so readers holding stale offsets
//! see zeroed memory rather than recycled garbage.

use crate::error::{ShmError, ShmResult};
use crate::platform;
use palisade::consts::{
    POINTER_ALIGN, VSM_CHUNK_MARKER, VSM_CLASS_LEN, VSM_FILENAME, VSM_HEAD_MARKER, VSM_IDENT_LEN,
    VSM_META_SUFFIX, VSM_TYPE_LEN, prndup,
};
use palisade::vtim;
use memmap2::MmapMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

/// Arena head at byte 0 of the file. All integers little-endian,
/// offsets relative to the file start.
#[repr(C)]
pub struct VsmHead {
    /// `VSMHEAD0`
    pub marker: [u8; 8],
    /// Size of this header.
    pub hdrsize: u64,
    /// Total mapped size.
    pub shm_size: u64,
    /// Offset of the first used chunk, 0 = none.
    pub first: AtomicU64,
    /// Allocator generation. 0 = mutation in progress or abandoned.
    pub alloc_seq: AtomicU32,
    _pad: u32,
    /// Coarse liveness counter, bumped by the owner at least once a second.
    pub age: AtomicU64,
}

/// Chunk header preceding every payload.
#[repr(C)]
pub struct VsmChunk {
    /// `VSMCHUNK`
    pub marker: [u8; 8],
    /// Total length including this header. 0 = freed.
    pub len: AtomicU64,
    /// Offset of the next chunk, 0 = last.
    pub next: AtomicU64,
    /// Class, NUL-padded.
    pub class: [u8; VSM_CLASS_LEN],
    /// Type, NUL-padded.
    pub typ: [u8; VSM_TYPE_LEN],
    /// Ident, NUL-padded.
    pub ident: [u8; VSM_IDENT_LEN],
}

static_assertions::const_assert_eq!(std::mem::size_of::<VsmHead>(), 48);
static_assertions::const_assert_eq!(std::mem::size_of::<VsmChunk>(), 168);
static_assertions::const_assert_eq!(std::mem::size_of::<VsmChunk>() % POINTER_ALIGN, 0);

/// Discovery sidecar written next to the arena file.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArenaMeta {
    /// Writer process ID.
    pub pid: u32,
    /// Total arena size in bytes.
    pub size: usize,
    /// Creation wall-clock time.
    pub created: f64,
}

/// A byte range inside the arena, tracked host-side only.
/// `used` keeps newest-first order; the element after index `i` is the
/// chunk whose `next` pointer leads to `i` in the shared list.
struct Range {
    id: u64,
    off: usize,
    len: usize,
    cool: f64,
}

/// Heap-backed fallback allocation, enumerable host-side only.
struct BogusMem {
    id: u64,
    buf: Box<[u8]>,
}

struct ArenaInner {
    #[allow(dead_code)]
    map: MmapMut, // keeps the mapping alive; all access goes through `base`
    used: Vec<Range>,
    cooling: Vec<Range>,
    free: Vec<Range>, // sorted by len ascending
    bogus: Vec<BogusMem>,
    next_id: u64,
    seq: u32,
}

/// The process-wide shared-memory arena. Construct one per runtime.
pub struct Arena {
    path: PathBuf,
    meta_path: PathBuf,
    base: *mut u8,
    size: usize,
    cool_duration: f64,
    n_bogus: AtomicU64,
    inner: Mutex<ArenaInner>,
}

// The raw base pointer aliases `inner.map`, whose lifetime equals the
// Arena's; mutation of allocator state happens under `inner`.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// Handle to one allocation. Cloneable; freeing is explicit via
/// [`Arena::free`]. The embedded `Arc` keeps the mapping alive.
#[derive(Clone)]
pub struct Alloc {
    arena: Arc<Arena>,
    id: u64,
    ptr: *mut u8,
    len: usize,
    off: usize, // payload offset in the arena, 0 for bogus
}

unsafe impl Send for Alloc {}
unsafe impl Sync for Alloc {}

impl Alloc {
    /// Payload pointer. Valid for the life of the arena.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the allocation fell back to the process heap and is not
    /// visible to external readers.
    #[inline]
    pub fn is_bogus(&self) -> bool {
        self.off == 0
    }

    /// Payload offset inside the arena file, 0 for bogus allocations.
    #[inline]
    pub fn offset(&self) -> usize {
        self.off
    }

    /// The owning arena.
    #[inline]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Payload as a mutable byte slice.
    ///
    /// # Safety
    /// The caller must be the only writer of this allocation.
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

fn copy_padded(dst: &mut [u8], src: &str) {
    dst.fill(0);
    dst[..src.len()].copy_from_slice(src.as_bytes());
}

impl Arena {
    /// Create a fresh arena of `size` bytes under `dir`, replacing any
    /// previous one, and write the discovery sidecar.
    pub fn create(dir: &Path, size: usize, cool_duration: f64) -> ShmResult<Arc<Arena>> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(VSM_FILENAME);
        let meta_path = dir.join(format!("{VSM_FILENAME}{VSM_META_SUFFIX}"));

        let head_len = prndup(std::mem::size_of::<VsmHead>());
        if size < head_len + std::mem::size_of::<VsmChunk>() + 64 {
            return Err(ShmError::BadSize { size });
        }

        let mut map = platform::create_map(&path, size)?;
        map.fill(0);
        let base = map.as_mut_ptr();

        // Initialize the head; the marker goes in last so a reader racing
        // the create never sees a marked-but-uninitialized head.
        {
            let head = unsafe { &mut *(base as *mut VsmHead) };
            head.hdrsize = std::mem::size_of::<VsmHead>() as u64;
            head.shm_size = size as u64;
            head.first.store(0, Ordering::Relaxed);
            head.alloc_seq.store(1, Ordering::Relaxed);
            head.age.store(0, Ordering::Relaxed);
            fence(Ordering::Release);
            head.marker = VSM_HEAD_MARKER;
        }

        let meta = ArenaMeta {
            pid: platform::current_pid(),
            size,
            created: vtim::real_now(),
        };
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;

        let arena = Arena {
            path,
            meta_path,
            base,
            size,
            cool_duration,
            n_bogus: AtomicU64::new(0),
            inner: Mutex::new(ArenaInner {
                map,
                used: Vec::new(),
                cooling: Vec::new(),
                free: vec![Range {
                    id: 0,
                    off: head_len,
                    len: size - head_len,
                    cool: 0.0,
                }],
                bogus: Vec::new(),
                next_id: 1,
                seq: 1,
            }),
        };
        tracing::info!(path = %arena.path.display(), size, "arena created");
        Ok(Arc::new(arena))
    }

    /// Path of the arena file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total mapped size.
    pub fn size(&self) -> usize {
        self.size
    }

    fn head(&self) -> &VsmHead {
        unsafe { &*(self.base as *const VsmHead) }
    }

    fn chunk_at(&self, off: usize) -> &VsmChunk {
        debug_assert!(off + std::mem::size_of::<VsmChunk>() <= self.size);
        unsafe { &*(self.base.add(off) as *const VsmChunk) }
    }

    /// Bump the liveness counter. Readers watch this to tell a stalled
    /// writer from a dead one.
    pub fn bump_age(&self) {
        self.head().age.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of allocations that fell back to the heap.
    pub fn bogus_count(&self) -> u64 {
        self.n_bogus.load(Ordering::Relaxed)
    }

    /// Mark the arena abandoned. Readers treat a zero generation as final.
    pub fn abandon(&self) {
        fence(Ordering::Release);
        self.head().alloc_seq.store(0, Ordering::Release);
    }

    fn seq_open(&self, inner: &mut ArenaInner) {
        let _ = inner;
        self.head().alloc_seq.store(0, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    fn seq_close(&self, inner: &mut ArenaInner) {
        fence(Ordering::SeqCst);
        inner.seq = inner.seq.wrapping_add(1);
        if inner.seq == 0 {
            inner.seq = 1;
        }
        self.head().alloc_seq.store(inner.seq, Ordering::Release);
    }

    /// Free list insert, collapsing adjacent ranges first. The list is
    /// kept sorted by size so allocation is best-fit by construction.
    fn insert_free(free: &mut Vec<Range>, mut r: Range) {
        loop {
            let mut merged = false;
            let mut i = 0;
            while i < free.len() {
                if free[i].off == r.off + r.len {
                    r.len += free[i].len;
                    free.remove(i);
                    merged = true;
                    break;
                }
                if r.off == free[i].off + free[i].len {
                    let prev = free.remove(i);
                    r.off = prev.off;
                    r.len += prev.len;
                    merged = true;
                    break;
                }
                i += 1;
            }
            if !merged {
                break;
            }
        }
        let pos = free.partition_point(|f| f.len <= r.len);
        free.insert(pos, r);
    }

    fn uncool(&self, inner: &mut ArenaInner, now: f64) {
        while let Some(first) = inner.cooling.first() {
            if first.cool > now {
                break;
            }
            let r = inner.cooling.remove(0);
            Self::insert_free(&mut inner.free, r);
        }
    }

    /// Allocate a chunk of at least `size` payload bytes, tagged for
    /// reader enumeration. Never fails for lack of arena space - the
    /// fallback is an unshared heap allocation.
    pub fn alloc(
        self: &Arc<Self>,
        size: usize,
        class: &str,
        typ: &str,
        ident: &str,
    ) -> ShmResult<Alloc> {
        if size == 0 {
            return Err(ShmError::BadSize { size });
        }
        if class.len() >= VSM_CLASS_LEN {
            return Err(ShmError::IdentTooLong {
                ident: class.to_string(),
            });
        }
        if typ.len() >= VSM_TYPE_LEN {
            return Err(ShmError::IdentTooLong {
                ident: typ.to_string(),
            });
        }
        if ident.len() >= VSM_IDENT_LEN {
            return Err(ShmError::IdentTooLong {
                ident: ident.to_string(),
            });
        }

        let size = prndup(size);
        let chunk_len = std::mem::size_of::<VsmChunk>();
        let l1 = size + chunk_len;
        let l2 = size + 2 * chunk_len;

        let mut inner = self.inner.lock();
        self.uncool(&mut inner, vtim::real_now());

        // Best fit: the free list is size-sorted, so the first range that
        // fits is the tightest. Split unless the remainder is too small to
        // hold another chunk.
        let mut found: Option<Range> = None;
        let mut i = 0;
        while i < inner.free.len() {
            if inner.free[i].len < l1 {
                i += 1;
                continue;
            }
            let mut r = inner.free.remove(i);
            if r.len > l2 {
                let rest = Range {
                    id: 0,
                    off: r.off + l1,
                    len: r.len - l1,
                    cool: 0.0,
                };
                r.len = l1;
                Self::insert_free(&mut inner.free, rest);
            }
            found = Some(r);
            break;
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let Some(mut r) = found else {
            // Arena exhausted: keep the caller running on plain heap
            // memory. The chunk is not reader-visible.
            let buf = vec![0u8; size].into_boxed_slice();
            let ptr = buf.as_ptr() as *mut u8;
            inner.bogus.push(BogusMem { id, buf });
            self.n_bogus.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(size, class, typ, ident, "arena full, heap fallback");
            return Ok(Alloc {
                arena: Arc::clone(self),
                id,
                ptr,
                len: size,
                off: 0,
            });
        };
        r.id = id;

        // Zero the whole range so stale bytes never read as content, set
        // up the chunk header, then publish by linking it in.
        self.seq_open(&mut inner);
        unsafe {
            std::ptr::write_bytes(self.base.add(r.off), 0, r.len);
        }
        {
            let chunk = unsafe { &mut *(self.base.add(r.off) as *mut VsmChunk) };
            chunk.len.store(l1 as u64, Ordering::Relaxed);
            chunk.next.store(0, Ordering::Relaxed);
            copy_padded(&mut chunk.class, class);
            copy_padded(&mut chunk.typ, typ);
            copy_padded(&mut chunk.ident, ident);
            fence(Ordering::Release);
            chunk.marker = VSM_CHUNK_MARKER;
        }
        fence(Ordering::Release);
        match inner.used.first() {
            Some(newest) => {
                debug_assert_eq!(self.chunk_at(newest.off).next.load(Ordering::Relaxed), 0);
                self.chunk_at(newest.off)
                    .next
                    .store(r.off as u64, Ordering::Release);
            }
            None => {
                self.head().first.store(r.off as u64, Ordering::Release);
            }
        }
        let off = r.off;
        inner.used.insert(0, r);
        self.seq_close(&mut inner);

        Ok(Alloc {
            arena: Arc::clone(self),
            id,
            ptr: unsafe { self.base.add(off + chunk_len) },
            len: size,
            off: off + chunk_len,
        })
    }

    /// Free an allocation: unlink it from the shared list, zero its
    /// length, and put the range on the cooling list.
    pub fn free(&self, alloc: &Alloc) {
        let mut inner = self.inner.lock();

        if alloc.is_bogus() {
            inner.bogus.retain(|b| b.id != alloc.id);
            return;
        }

        let Some(pos) = inner.used.iter().position(|r| r.id == alloc.id) else {
            return; // double free is a no-op
        };

        self.seq_open(&mut inner);
        let off = inner.used[pos].off;
        let next = self.chunk_at(off).next.load(Ordering::Relaxed);
        if pos + 1 < inner.used.len() {
            let prev_off = inner.used[pos + 1].off;
            self.chunk_at(prev_off).next.store(next, Ordering::Release);
        } else {
            self.head().first.store(next, Ordering::Release);
        }
        fence(Ordering::Release);
        self.chunk_at(off).len.store(0, Ordering::Release);
        self.seq_close(&mut inner);

        let mut r = inner.used.remove(pos);
        r.cool = vtim::real_now() + self.cool_duration;
        inner.cooling.push(r);
    }

    /// Count of live (used-list) allocations, for introspection and tests.
    pub fn used_count(&self) -> usize {
        self.inner.lock().used.len()
    }

    /// Bytes on the free list, for introspection and tests.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free.iter().map(|r| r.len).sum()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // The arena file stays behind for post-mortem inspection; only
        // the generation is zeroed and the discovery sidecar removed.
        self.abandon();
        let _ = std::fs::remove_file(&self.meta_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(cool: f64) -> (tempfile::TempDir, Arc<Arena>) {
        let dir = tempfile::tempdir().unwrap();
        let a = Arena::create(dir.path(), 64 * 1024, cool).unwrap();
        (dir, a)
    }

    #[test]
    fn test_alloc_basics() {
        let (_d, a) = arena(60.0);
        let x = a.alloc(100, "Stat", "main", "").unwrap();
        assert!(!x.is_bogus());
        assert_eq!(x.len(), prndup(100));
        assert_eq!(a.used_count(), 1);
    }

    #[test]
    fn test_ident_too_long() {
        let (_d, a) = arena(60.0);
        let long = "x".repeat(VSM_IDENT_LEN);
        assert!(matches!(
            a.alloc(8, "Stat", "t", &long),
            Err(ShmError::IdentTooLong { .. })
        ));
    }

    #[test]
    fn test_free_cools_before_reuse() {
        let (_d, a) = arena(60.0);
        let before = a.free_bytes();
        let x = a.alloc(1024, "Stat", "t", "a").unwrap();
        let after_alloc = a.free_bytes();
        assert!(after_alloc < before);
        a.free(&x);
        // Still cooling: the bytes are not back on the free list.
        assert_eq!(a.free_bytes(), after_alloc);
        assert_eq!(a.used_count(), 0);
    }

    #[test]
    fn test_cooled_range_returns() {
        let (_d, a) = arena(0.0);
        let before = a.free_bytes();
        let x = a.alloc(1024, "Stat", "t", "a").unwrap();
        a.free(&x);
        // Zero cooling: the next allocation pass reclaims it.
        let _y = a.alloc(8, "Stat", "t", "b").unwrap();
        assert!(a.free_bytes() > before - 2048);
    }

    #[test]
    fn test_bogus_fallback() {
        let (_d, a) = arena(60.0);
        // Exhaust the arena.
        let mut held = Vec::new();
        loop {
            let x = a.alloc(4096, "Stat", "t", "fill").unwrap();
            let bogus = x.is_bogus();
            held.push(x);
            if bogus {
                break;
            }
        }
        assert!(a.bogus_count() >= 1);
        // Bogus memory is still usable.
        let last = held.last().unwrap();
        unsafe { last.bytes_mut()[0] = 7 };
    }

    #[test]
    fn test_generation_stable_after_ops() {
        let (_d, a) = arena(60.0);
        let x = a.alloc(64, "Stat", "t", "a").unwrap();
        let head = a.head();
        let seq = head.alloc_seq.load(Ordering::Acquire);
        assert_ne!(seq, 0);
        a.free(&x);
        let seq2 = head.alloc_seq.load(Ordering::Acquire);
        assert_ne!(seq2, 0);
        assert_ne!(seq2, seq);
    }

    #[test]
    fn test_double_free_is_noop() {
        let (_d, a) = arena(60.0);
        let x = a.alloc(64, "Stat", "t", "a").unwrap();
        a.free(&x);
        a.free(&x);
        assert_eq!(a.used_count(), 0);
    }
}
