//! The ring log writer.
//!
//! One circular buffer of 32-bit words inside an arena chunk, divided into
//! a fixed number of segments. The head publishes a monotonically
//! increasing segment counter and a per-segment offset table so readers
//! can jump into the middle of the log without scanning from zero, and can
//! detect being lapped.
//!
//! Writing never blocks the hot path on readers: the only lock is the
//! writer-side position mutex, taken try-first so contention is visible as
//! a counter instead of jitter. The record header word is written last,
//! after a release fence, so a reader either sees a complete record or the
//! end marker.

use crate::arena::{Alloc, Arena};
use crate::error::{ShmError, ShmResult};
use crate::record::{self, VslTag, hdr_word, payload_words, rec_words};
use crate::stats::{MainStats, StatRef};
use palisade::consts::{
    VSL_ENDMARKER, VSL_HEAD_MARKER, VSL_OVERHEAD_WORDS, VSL_SEGMENTS, VSM_CLASS_LOG,
};
use palisade::params::Params;
use heapless::Deque;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering, fence};

/// Head of the ring chunk payload.
#[repr(C)]
pub struct VslHead {
    /// `VSLHEAD2`
    pub marker: [u8; 8],
    /// Words per segment.
    pub segsize: u64,
    /// Current segment number; wraps natively at `u32::MAX`.
    pub segment_n: AtomicU32,
    _pad: u32,
    /// Word offset of the first record of each segment, -1 = unwritten.
    pub offset: [AtomicI64; VSL_SEGMENTS as usize],
}

static_assertions::const_assert_eq!(std::mem::size_of::<VslHead>(), 88);

/// Records remembered for the panic dump.
pub const TAIL_RECORDS: usize = 64;

/// Bytes of payload head kept per remembered record.
pub const TAIL_HEAD_BYTES: usize = 32;

/// One remembered record (tag, xid, payload head).
#[derive(Debug, Clone)]
pub struct TailRec {
    /// Wire tag.
    pub tag: u8,
    /// Transaction id.
    pub xid: u64,
    /// First bytes of the payload.
    pub head: heapless::Vec<u8, TAIL_HEAD_BYTES>,
}

struct WriterPos {
    wptr: usize,
    segment_n: u32,
}

/// The ring log. One per runtime; shared by every worker.
pub struct Vsl {
    #[allow(dead_code)]
    alloc: Alloc, // owns the ring chunk, keeps the arena alive
    base: *mut u8,
    segsize: usize,
    ring_words: usize,
    reclen: usize,
    mask: u32,
    buffer_bytes: usize,
    stats: StatRef<MainStats>,
    pos: Mutex<WriterPos>,
    tail: Mutex<Deque<TailRec, TAIL_RECORDS>>,
}

unsafe impl Send for Vsl {}
unsafe impl Sync for Vsl {}

impl Vsl {
    /// Allocate and initialize the ring inside `arena`.
    pub fn new(
        arena: &Arc<Arena>,
        stats: StatRef<MainStats>,
        params: &Params,
    ) -> ShmResult<Arc<Vsl>> {
        let alloc = arena.alloc(params.vsl_space, VSM_CLASS_LOG, "ring", "")?;
        let head_len = std::mem::size_of::<VslHead>();
        if alloc.len() <= head_len + 256 {
            return Err(ShmError::BadSize { size: alloc.len() });
        }
        let segsize = ((alloc.len() - head_len) / 4) / VSL_SEGMENTS as usize;
        let ring_words = segsize * VSL_SEGMENTS as usize;

        // A record must always fit in the ring with room for the marker.
        let reclen = params
            .vsl_reclen
            .min((segsize.saturating_sub(VSL_OVERHEAD_WORDS + 2)) * 4);
        if reclen == 0 {
            return Err(ShmError::BadSize { size: params.vsl_space });
        }

        let base = alloc.as_ptr();
        // Seed the segment counter so the very first ring cycle exercises
        // the native u32 wraparound.
        let seed = u32::MAX - (VSL_SEGMENTS - 1);
        debug_assert_eq!(seed % VSL_SEGMENTS, 0);
        {
            let head = unsafe { &mut *(base as *mut VslHead) };
            head.segsize = segsize as u64;
            head.segment_n.store(seed, Ordering::Relaxed);
            head.offset[0].store(0, Ordering::Relaxed);
            for u in 1..VSL_SEGMENTS as usize {
                head.offset[u].store(-1, Ordering::Relaxed);
            }
            fence(Ordering::Release);
            head.marker = VSL_HEAD_MARKER;
        }

        Ok(Arc::new(Vsl {
            alloc,
            base,
            segsize,
            ring_words,
            reclen,
            mask: record::mask_from_names(&params.vsl_mask),
            buffer_bytes: params.vsl_buffer,
            stats,
            pos: Mutex::new(WriterPos {
                wptr: 0,
                segment_n: seed,
            }),
            tail: Mutex::new(Deque::new()),
        }))
    }

    #[inline]
    fn head(&self) -> &VslHead {
        unsafe { &*(self.base as *const VslHead) }
    }

    #[inline]
    fn word_ptr(&self, idx: usize) -> *mut u32 {
        debug_assert!(idx < self.ring_words + 1);
        unsafe { (self.base.add(std::mem::size_of::<VslHead>()) as *mut u32).add(idx) }
    }

    /// Maximum payload bytes per record.
    pub fn reclen(&self) -> usize {
        self.reclen
    }

    /// Current published segment number, for tests and introspection.
    pub fn segment_n(&self) -> u32 {
        self.head().segment_n.load(Ordering::Acquire)
    }

    #[inline]
    fn masked(&self, tag: VslTag) -> bool {
        self.mask & tag.mask_bit() != 0
    }

    fn clamp<'a>(&self, payload: &'a [u8], scratch: &'a mut Vec<u8>) -> &'a [u8] {
        if payload.len() <= self.reclen {
            return payload;
        }
        self.stats.vsl_trunc.fetch_add(1, Ordering::Relaxed);
        scratch.clear();
        scratch.extend_from_slice(&payload[..self.reclen]);
        *scratch.last_mut().unwrap() = 0;
        scratch
    }

    fn note_tail(&self, tag: u8, xid: u64, data: &[u8]) {
        let mut head = heapless::Vec::new();
        let n = data.len().min(TAIL_HEAD_BYTES);
        let _ = head.extend_from_slice(&data[..n]);
        let mut t = self.tail.lock();
        if t.is_full() {
            t.pop_front();
        }
        let _ = t.push_back(TailRec { tag, xid, head });
    }

    /// Snapshot of the most recent records, for the panic dump.
    pub fn tail_snapshot(&self) -> Vec<TailRec> {
        self.tail.lock().iter().cloned().collect()
    }

    /// Reserve `len` payload bytes in the ring; returns the word pointer of
    /// the record header. The reserved region belongs to the caller until
    /// the header word is stored.
    fn reserve(&self, len: usize, records: u64, flushes: u64) -> *mut u32 {
        let mut pos = match self.pos.try_lock() {
            Some(g) => g,
            None => {
                self.stats.shm_cont.fetch_add(1, Ordering::Relaxed);
                self.pos.lock()
            }
        };

        self.stats.shm_writes.fetch_add(1, Ordering::Relaxed);
        self.stats.shm_records.fetch_add(records, Ordering::Relaxed);
        self.stats.shm_flushes.fetch_add(flushes, Ordering::Relaxed);
        self.stats
            .shm_bytes
            .fetch_add((rec_words(len) * 4) as u64, Ordering::Relaxed);

        let need = rec_words(len);
        if pos.wptr + need + 1 > self.ring_words {
            self.wrap(&mut pos);
        }
        let at = pos.wptr;
        pos.wptr += need;
        unsafe { self.word_ptr(pos.wptr).write_volatile(VSL_ENDMARKER) };
        fence(Ordering::Release);

        // Advance the per-segment entry points past the space just taken.
        while pos.wptr / self.segsize > (pos.segment_n % VSL_SEGMENTS) as usize {
            pos.segment_n = pos.segment_n.wrapping_add(1);
            self.head().offset[(pos.segment_n % VSL_SEGMENTS) as usize]
                .store(pos.wptr as i64, Ordering::Release);
        }
        self.head()
            .segment_n
            .store(pos.segment_n, Ordering::Release);

        self.word_ptr(at)
    }

    fn wrap(&self, pos: &mut WriterPos) {
        pos.segment_n = pos
            .segment_n
            .wrapping_add(VSL_SEGMENTS - (pos.segment_n % VSL_SEGMENTS));
        debug_assert_eq!(pos.segment_n % VSL_SEGMENTS, 0);
        self.head().offset[0].store(0, Ordering::Release);
        unsafe { self.word_ptr(0).write_volatile(VSL_ENDMARKER) };
        fence(Ordering::Release);
        if pos.wptr != 0 {
            unsafe { self.word_ptr(pos.wptr).write_volatile(record::wrap_word()) };
        }
        pos.wptr = 0;
        self.head()
            .segment_n
            .store(pos.segment_n, Ordering::Release);
        self.stats.shm_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Finish a reserved record: payload, xid, fence, header word last.
    unsafe fn emit(&self, p: *mut u32, tag: u8, xid: u64, data: &[u8]) {
        unsafe {
            let dst = p.add(VSL_OVERHEAD_WORDS) as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            let pad = payload_words(data.len()) * 4 - data.len();
            if pad > 0 {
                std::ptr::write_bytes(dst.add(data.len()), 0, pad);
            }
            p.add(1).write_volatile(xid as u32);
            p.add(2).write_volatile((xid >> 32) as u32);
            fence(Ordering::Release);
            (*(p as *const AtomicU32)).store(hdr_word(tag, data.len()), Ordering::Release);
        }
    }

    /// Write one unbuffered record. Use sparingly on hot paths - every
    /// call takes the ring mutex; workers should log through a
    /// [`VslBuffer`].
    pub fn log(&self, tag: VslTag, xid: u64, payload: &[u8]) {
        if self.masked(tag) {
            return;
        }
        let mut scratch = Vec::new();
        let data = self.clamp(payload, &mut scratch);
        let p = self.reserve(data.len(), 1, 0);
        unsafe { self.emit(p, tag as u8, xid, data) };
        self.note_tail(tag as u8, xid, data);
    }

    /// Create a per-worker log buffer.
    pub fn buffer(self: &Arc<Self>) -> VslBuffer {
        // The flushed batch is itself one record: it must fit the length
        // field and one segment of the ring.
        let min_words = rec_words(self.reclen) + 1;
        let max_words = (self.segsize.saturating_sub(VSL_OVERHEAD_WORDS + 2))
            .min(palisade::consts::VSL_LEN_MASK as usize / 4)
            .max(min_words);
        let words = (self.buffer_bytes / 4).clamp(min_words, max_words);
        VslBuffer {
            vsl: Arc::clone(self),
            buf: vec![0u32; words],
            wlp: 0,
            wlr: 0,
            xid: 0,
        }
    }
}

/// Per-worker log buffer. Records accumulate locally and land in the ring
/// as one `Batch` record, so a transaction's records stay contiguous and
/// the ring mutex is taken once per flush instead of once per record.
pub struct VslBuffer {
    vsl: Arc<Vsl>,
    buf: Vec<u32>,
    wlp: usize,
    wlr: u64,
    xid: u64,
}

impl VslBuffer {
    /// Bind the buffer to a transaction, flushing anything pending.
    pub fn begin(&mut self, xid: u64) {
        self.flush();
        self.xid = xid;
    }

    /// Transaction id this buffer is bound to, 0 if none.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Append one record.
    pub fn log(&mut self, tag: VslTag, payload: &[u8]) {
        if self.vsl.masked(tag) {
            return;
        }
        let mut scratch = Vec::new();
        let data = self.vsl.clamp(payload, &mut scratch);
        let need = rec_words(data.len());
        if self.wlp + need > self.buf.len() {
            self.flush_inner(1);
        }
        debug_assert!(self.wlp + need <= self.buf.len());

        let base = self.wlp;
        self.buf[base] = hdr_word(tag as u8, data.len());
        self.buf[base + 1] = self.xid as u32;
        self.buf[base + 2] = (self.xid >> 32) as u32;
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            self.buf[base + VSL_OVERHEAD_WORDS + i] = u32::from_le_bytes(w);
        }
        self.wlp += need;
        self.wlr += 1;
        self.vsl.note_tail(tag as u8, self.xid, data);
    }

    /// Flush pending records into the ring.
    pub fn flush(&mut self) {
        self.flush_inner(0);
    }

    fn flush_inner(&mut self, flushes: u64) {
        if self.wlp == 0 {
            return;
        }
        let len_bytes = self.wlp * 4;
        let p = self.vsl.reserve(len_bytes, self.wlr, flushes);
        unsafe {
            let src = self.buf.as_ptr() as *const u8;
            let dst = p.add(VSL_OVERHEAD_WORDS) as *mut u8;
            std::ptr::copy_nonoverlapping(src, dst, len_bytes);
            p.add(1).write_volatile(0);
            p.add(2).write_volatile(0);
            fence(Ordering::Release);
            (*(p as *const AtomicU32)).store(
                hdr_word(VslTag::Batch as u8, len_bytes),
                Ordering::Release,
            );
        }
        self.wlp = 0;
        self.wlr = 0;
    }

    /// End the bound transaction: flush and unbind.
    pub fn end(&mut self) {
        self.flush();
        self.xid = 0;
    }
}

impl Drop for VslBuffer {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk() -> (tempfile::TempDir, Arc<Vsl>, StatRef<MainStats>) {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 2 * 1024 * 1024, 60.0).unwrap();
        let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "").unwrap();
        let vsl = Vsl::new(&arena, stats.clone(), &Params::default()).unwrap();
        (dir, vsl, stats)
    }

    #[test]
    fn test_segment_seed_near_wraparound() {
        let (_d, vsl, _s) = mk();
        assert_eq!(vsl.segment_n(), u32::MAX - (VSL_SEGMENTS - 1));
        assert_eq!(vsl.segment_n() % VSL_SEGMENTS, 0);
    }

    #[test]
    fn test_unbuffered_write_counts() {
        let (_d, vsl, stats) = mk();
        vsl.log(VslTag::Debug, 7, b"hello");
        assert_eq!(stats.shm_writes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.shm_records.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_truncation_counted() {
        let (_d, vsl, stats) = mk();
        let big = vec![b'x'; vsl.reclen() + 1];
        vsl.log(VslTag::Debug, 1, &big);
        assert_eq!(stats.vsl_trunc.load(Ordering::Relaxed), 1);
        // At the boundary there is no truncation.
        let exact = vec![b'y'; vsl.reclen()];
        vsl.log(VslTag::Debug, 2, &exact);
        assert_eq!(stats.vsl_trunc.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wrap_advances_by_segments() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 256 * 1024, 60.0).unwrap();
        let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "").unwrap();
        let mut params = Params::default();
        params.vsl_space = 16 * 1024; // small ring so it cycles fast
        let vsl = Vsl::new(&arena, stats.clone(), &params).unwrap();

        let start = vsl.segment_n();
        let payload = vec![b'z'; 200];
        for i in 0..1000u64 {
            vsl.log(VslTag::Debug, i, &payload);
        }
        assert!(stats.shm_cycles.load(Ordering::Relaxed) > 0);
        // The counter wrapped through u32::MAX: it is now numerically
        // below the seeded start value but still ahead of it.
        let now = vsl.segment_n();
        assert!(now < start);
        assert!(now.wrapping_sub(start) > 0);
    }

    #[test]
    fn test_masked_tag_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 2 * 1024 * 1024, 60.0).unwrap();
        let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "").unwrap();
        let mut params = Params::default();
        params.vsl_mask = vec!["Debug".into()];
        let vsl = Vsl::new(&arena, stats.clone(), &params).unwrap();
        vsl.log(VslTag::Debug, 1, b"suppressed");
        assert_eq!(stats.shm_writes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_tail_remembers_recent() {
        let (_d, vsl, _s) = mk();
        for i in 0..100u64 {
            vsl.log(VslTag::Debug, i, format!("rec {i}").as_bytes());
        }
        let tail = vsl.tail_snapshot();
        assert_eq!(tail.len(), TAIL_RECORDS);
        assert_eq!(tail.last().unwrap().xid, 99);
    }

    #[test]
    fn test_buffer_flush_is_batch() {
        let (_d, vsl, stats) = mk();
        let mut b = vsl.buffer();
        b.begin(42);
        b.log(VslTag::Begin, b"req");
        b.log(VslTag::Url, b"/a");
        b.end();
        // One ring write, two records.
        assert_eq!(stats.shm_writes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.shm_records.load(Ordering::Relaxed), 2);
    }
}
