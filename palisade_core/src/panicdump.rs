//! Post-mortem panic dumps.
//!
//! A chunk of class `Panic` is reserved in the arena at startup. The
//! installed hook formats the panic (thread, message, location) plus the
//! most recent log records into that chunk, so the supervisor can extract
//! the state of the dying process from the arena file after the crash.

use palisade_shm::{Alloc, Arena, ShmResult, Vsl};
use palisade::consts::VSM_CLASS_PANIC;
use std::fmt::Write as _;
use std::sync::Arc;

/// Bytes reserved for the dump.
pub const PANIC_REGION_SIZE: usize = 16 * 1024;

/// The reserved dump region.
pub struct PanicRegion {
    alloc: Alloc,
}

impl PanicRegion {
    /// Reserve the region in `arena`.
    pub fn reserve(arena: &Arc<Arena>) -> ShmResult<PanicRegion> {
        let alloc = arena.alloc(PANIC_REGION_SIZE, VSM_CLASS_PANIC, "dump", "")?;
        Ok(PanicRegion { alloc })
    }

    fn write(&self, text: &str) {
        let bytes = text.as_bytes();
        let n = bytes.len().min(self.alloc.len() - 1);
        unsafe {
            let dst = self.alloc.bytes_mut();
            dst[..n].copy_from_slice(&bytes[..n]);
            dst[n] = 0;
        }
    }
}

/// Install the hook. The previous hook still runs afterwards so normal
/// stderr reporting is preserved.
pub fn install(region: PanicRegion, vsl: &Arc<Vsl>) {
    let vsl = Arc::clone(vsl);
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let mut out = String::with_capacity(4096);
        let thread = std::thread::current();
        let _ = writeln!(out, "panic in thread '{}'", thread.name().unwrap_or("?"));
        if let Some(loc) = info.location() {
            let _ = writeln!(out, "at {}:{}:{}", loc.file(), loc.line(), loc.column());
        }
        let payload = info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            let _ = writeln!(out, "message: {s}");
        } else if let Some(s) = payload.downcast_ref::<String>() {
            let _ = writeln!(out, "message: {s}");
        }
        let _ = writeln!(out, "--- recent log records ---");
        for rec in vsl.tail_snapshot() {
            let head = String::from_utf8_lossy(&rec.head);
            let _ = writeln!(out, "tag={} xid={} {:?}", rec.tag, rec.xid, head);
        }
        region.write(&out);
        // Publish: the arena generation may be mid-update, but the dump
        // region itself is stable and the marker already in place.
        prev(info);
    }));
}
