//! Out-of-process reader API.
//!
//! Readers map the arena file read-only and follow the chunk list and the
//! ring log without ever interlocking with the writer. Consistency comes
//! from the publication protocol: the allocator generation brackets list
//! mutations, record header words are written last, and the ring's
//! segment counter tells a cursor when it has been lapped.

use crate::arena::{VsmChunk, VsmHead};
use crate::error::{ShmError, ShmResult};
use crate::log::VslHead;
use crate::record::{self, OwnedRecord, VslTag};
use palisade::consts::{
    VSL_ENDMARKER, VSL_HEAD_MARKER, VSL_SEGMENTS, VSL_WRAP_TAG, VSM_CHUNK_MARKER, VSM_CLASS_LOG,
    VSM_FILENAME, VSM_HEAD_MARKER,
};
use memmap2::Mmap;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{Ordering, fence};

/// One enumerated chunk.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    /// Payload offset inside the file.
    pub off: usize,
    /// Payload length in bytes.
    pub len: usize,
    /// Chunk class.
    pub class: String,
    /// Chunk type.
    pub typ: String,
    /// Chunk ident.
    pub ident: String,
}

fn field_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// A read-only attachment to an arena.
pub struct VsmReader {
    map: Mmap,
}

impl VsmReader {
    /// Attach the arena under `dir`. Works on abandoned arenas too, so a
    /// supervisor can extract a panic dump post-crash.
    pub fn attach(dir: &Path) -> ShmResult<VsmReader> {
        let map = crate::platform::attach_map(&dir.join(VSM_FILENAME))?;
        let reader = VsmReader { map };
        let head = reader.head();
        if head.marker != VSM_HEAD_MARKER {
            return Err(ShmError::BadMarker {
                what: "arena head".to_string(),
            });
        }
        if head.shm_size as usize > reader.map.len() {
            return Err(ShmError::BadSize {
                size: head.shm_size as usize,
            });
        }
        Ok(reader)
    }

    fn head(&self) -> &VsmHead {
        unsafe { &*(self.map.as_ptr() as *const VsmHead) }
    }

    /// Current allocator generation; 0 means abandoned.
    pub fn alloc_seq(&self) -> u32 {
        self.head().alloc_seq.load(Ordering::Acquire)
    }

    /// Liveness counter.
    pub fn age(&self) -> u64 {
        self.head().age.load(Ordering::Acquire)
    }

    fn walk(&self) -> ShmResult<Vec<ChunkInfo>> {
        let chunk_hdr = std::mem::size_of::<VsmChunk>();
        let max_chunks = self.map.len() / chunk_hdr + 1;
        let mut out = Vec::new();
        let mut off = self.head().first.load(Ordering::Acquire) as usize;
        while off != 0 {
            if out.len() > max_chunks {
                return Err(ShmError::Corrupt {
                    detail: "chunk list cycle".to_string(),
                });
            }
            if off + chunk_hdr > self.map.len() {
                return Err(ShmError::Corrupt {
                    detail: format!("chunk offset {off} out of range"),
                });
            }
            fence(Ordering::Acquire);
            let chunk = unsafe { &*(self.map.as_ptr().add(off) as *const VsmChunk) };
            if chunk.marker != VSM_CHUNK_MARKER {
                return Err(ShmError::Corrupt {
                    detail: format!("bad chunk marker at {off}"),
                });
            }
            let len = chunk.len.load(Ordering::Acquire) as usize;
            if len < chunk_hdr || off + len > self.map.len() {
                return Err(ShmError::Corrupt {
                    detail: format!("bad chunk length {len} at {off}"),
                });
            }
            out.push(ChunkInfo {
                off: off + chunk_hdr,
                len: len - chunk_hdr,
                class: field_str(&chunk.class),
                typ: field_str(&chunk.typ),
                ident: field_str(&chunk.ident),
            });
            off = chunk.next.load(Ordering::Acquire) as usize;
        }
        Ok(out)
    }

    /// Enumerate all chunks. Retries while the writer mutates the list;
    /// on a permanently abandoned arena one best-effort pass is made for
    /// post-mortem extraction.
    pub fn chunks(&self) -> ShmResult<Vec<ChunkInfo>> {
        let head = self.head();
        let mut zero_runs = 0;
        for _ in 0..16 {
            let seq = head.alloc_seq.load(Ordering::Acquire);
            if seq == 0 {
                zero_runs += 1;
                if zero_runs >= 4 {
                    // Abandoned, not in-flight: one best-effort pass.
                    return self.walk();
                }
                std::thread::yield_now();
                continue;
            }
            match self.walk() {
                Ok(v) => {
                    fence(Ordering::Acquire);
                    if head.alloc_seq.load(Ordering::Acquire) == seq {
                        return Ok(v);
                    }
                }
                Err(ShmError::Corrupt { detail }) => {
                    // Corruption under a stable generation is real.
                    if head.alloc_seq.load(Ordering::Acquire) == seq {
                        return Err(ShmError::Corrupt { detail });
                    }
                }
                Err(e) => return Err(e),
            }
            std::thread::yield_now();
        }
        Err(ShmError::Unstable)
    }

    /// Find one chunk by class, type and optionally ident.
    pub fn find(&self, class: &str, typ: &str, ident: Option<&str>) -> ShmResult<Option<ChunkInfo>> {
        Ok(self.chunks()?.into_iter().find(|c| {
            c.class == class && c.typ == typ && ident.is_none_or(|i| c.ident == i)
        }))
    }

    /// Payload bytes of a chunk.
    pub fn payload(&self, info: &ChunkInfo) -> &[u8] {
        &self.map[info.off..info.off + info.len]
    }

    /// Read a counter row of type `T` (class `Stat`).
    pub fn stats_row<T>(&self, typ: &str, ident: &str) -> ShmResult<Option<&T>> {
        match self.find("Stat", typ, Some(ident))? {
            Some(info) => Ok(unsafe { crate::stats::row_from_payload(self.payload(&info)) }),
            None => Ok(None),
        }
    }
}

/// A cursor step: either a record or a notice that the cursor was lapped
/// and has resynchronized to the oldest safe segment.
#[derive(Debug)]
pub enum CursorStep {
    /// The next record in log order.
    Record(OwnedRecord),
    /// The writer lapped this cursor; records were lost.
    Overrun,
}

/// A cursor over the ring log.
pub struct VslCursor<'a> {
    head: &'a VslHead,
    ring: *const u32,
    ring_words: usize,
    segsize: usize,
    pos: usize,
    cur_seg: u32,
    pending: VecDeque<OwnedRecord>,
    _life: PhantomData<&'a ()>,
}

impl<'a> VslCursor<'a> {
    /// Attach to the ring chunk of `reader`.
    pub fn attach(reader: &'a VsmReader) -> ShmResult<VslCursor<'a>> {
        let info = reader
            .find(VSM_CLASS_LOG, "ring", None)?
            .ok_or_else(|| ShmError::NotFound {
                path: "log chunk".to_string(),
            })?;
        let payload = reader.payload(&info);
        let head_len = std::mem::size_of::<VslHead>();
        if payload.len() < head_len {
            return Err(ShmError::BadSize {
                size: payload.len(),
            });
        }
        let head = unsafe { &*(payload.as_ptr() as *const VslHead) };
        if head.marker != VSL_HEAD_MARKER {
            return Err(ShmError::BadMarker {
                what: "log head".to_string(),
            });
        }
        let segsize = head.segsize as usize;
        let ring_words = segsize * VSL_SEGMENTS as usize;
        if segsize == 0 || head_len + ring_words * 4 > payload.len() {
            return Err(ShmError::Corrupt {
                detail: "log geometry".to_string(),
            });
        }
        let mut cursor = VslCursor {
            head,
            ring: unsafe { payload.as_ptr().add(head_len) as *const u32 },
            ring_words,
            segsize,
            pos: 0,
            cur_seg: 0,
            pending: VecDeque::new(),
            _life: PhantomData,
        };
        cursor.resync();
        Ok(cursor)
    }

    /// Jump to the oldest segment still guaranteed valid.
    fn resync(&mut self) {
        let seg_n = self.head.segment_n.load(Ordering::Acquire);
        for d in (0..VSL_SEGMENTS - 1).rev() {
            let s = seg_n.wrapping_sub(d);
            let off = self.head.offset[(s % VSL_SEGMENTS) as usize].load(Ordering::Acquire);
            if off >= 0 && (off as usize) < self.ring_words {
                self.pos = off as usize;
                self.cur_seg = s;
                return;
            }
        }
        self.pos = 0;
        self.cur_seg = seg_n;
    }

    #[inline]
    fn lapped(&self) -> bool {
        let head_seg = self.head.segment_n.load(Ordering::Acquire);
        head_seg.wrapping_sub(self.cur_seg) > VSL_SEGMENTS - 2
    }

    #[inline]
    fn word(&self, idx: usize) -> u32 {
        unsafe { self.ring.add(idx).read_volatile() }
    }

    fn explode_batch(&mut self, data: &[u8]) {
        let mut off = 0;
        while off + 12 <= data.len() {
            let w = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
            if w == VSL_ENDMARKER {
                break;
            }
            let len = record::hdr_len(w);
            let total = record::rec_words(len) * 4;
            if off + total > data.len() {
                break;
            }
            let lo = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap());
            let hi = u32::from_le_bytes(data[off + 8..off + 12].try_into().unwrap());
            self.pending.push_back(OwnedRecord {
                tag: record::hdr_tag(w),
                xid: (hi as u64) << 32 | lo as u64,
                data: data[off + 12..off + 12 + len].to_vec(),
            });
            off += total;
        }
    }

    /// Next record, an overrun notice, or `None` when caught up with the
    /// writer.
    pub fn next(&mut self) -> Option<CursorStep> {
        if let Some(r) = self.pending.pop_front() {
            return Some(CursorStep::Record(r));
        }
        loop {
            if self.lapped() {
                self.resync();
                return Some(CursorStep::Overrun);
            }
            fence(Ordering::Acquire);
            let w = self.word(self.pos);
            if w == VSL_ENDMARKER {
                return None;
            }
            if record::hdr_tag(w) == VSL_WRAP_TAG {
                self.cur_seg = self
                    .cur_seg
                    .wrapping_add(VSL_SEGMENTS - (self.cur_seg % VSL_SEGMENTS));
                self.pos = 0;
                continue;
            }
            let len = record::hdr_len(w);
            let words = record::rec_words(len);
            if self.pos + words >= self.ring_words {
                // Torn header or stale bytes; fall back to a safe segment.
                self.resync();
                return Some(CursorStep::Overrun);
            }
            fence(Ordering::Acquire);
            let lo = self.word(self.pos + 1);
            let hi = self.word(self.pos + 2);
            let mut data = vec![0u8; len];
            unsafe {
                let src = (self.ring.add(self.pos + 3)) as *const u8;
                std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), len);
            }
            fence(Ordering::Acquire);
            if self.lapped() {
                // The copy may be torn; discard it.
                self.resync();
                return Some(CursorStep::Overrun);
            }

            let old_region = self.pos / self.segsize;
            self.pos += words;
            let new_region = (self.pos.min(self.ring_words - 1)) / self.segsize;
            self.cur_seg = self.cur_seg.wrapping_add((new_region - old_region) as u32);

            let rec = OwnedRecord {
                tag: record::hdr_tag(w),
                xid: (hi as u64) << 32 | lo as u64,
                data,
            };
            if rec.tag == VslTag::Batch as u8 {
                self.explode_batch(&rec.data);
                match self.pending.pop_front() {
                    Some(r) => return Some(CursorStep::Record(r)),
                    None => continue,
                }
            }
            return Some(CursorStep::Record(rec));
        }
    }

    /// Drain everything currently readable.
    pub fn read_all(&mut self) -> (Vec<OwnedRecord>, usize) {
        let mut recs = Vec::new();
        let mut overruns = 0;
        while let Some(step) = self.next() {
            match step {
                CursorStep::Record(r) => recs.push(r),
                CursorStep::Overrun => overruns += 1,
            }
        }
        (recs, overruns)
    }
}
