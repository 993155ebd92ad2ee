//! The fd waiter.
//!
//! One thread multiplexes every idle-keepalive file descriptor between
//! requests: a kernel event facility for readiness, a deadline min-heap
//! for timeouts, and a self-pipe so another thread can shorten the
//! current sleep. Exactly one of {callback, successful cancel} happens
//! per entered fd.
//!
//! Two implementations share the bookkeeping: epoll on Linux and a
//! portable poll(2) fallback.

mod epoll;
mod poll;

pub use epoll::EpollWaiter;
pub use poll::PollWaiter;

use crate::error::{CoreError, CoreResult};
use crate::heap::{BinHeap, HeapItem, NOIDX};
use crate::sync::{LockClass, Mtx};
use palisade::params::WaiterKind;
use palisade_shm::{Arena, StatRef, WaiterStats};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Why a callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The deadline passed.
    Timeout,
    /// The peer closed (EOF, hangup or error).
    RemClose,
    /// Data arrived.
    Action,
}

/// Ticket for a pending entry, used to cancel it.
pub type WaitToken = u64;

/// Consumed by exactly one dispatch.
pub type WaitCallback = Box<dyn FnOnce(WaitReason, f64) + Send>;

/// An fd handed to the waiter.
pub struct Waited {
    /// The descriptor. The caller keeps ownership; it must stay open
    /// until the callback or a successful cancel.
    pub fd: RawFd,
    /// Absolute deadline (wall clock seconds).
    pub deadline: f64,
    /// Called once with the outcome.
    pub on_event: WaitCallback,
}

/// The waiter interface. One instance owns one scheduler thread.
pub trait Waiter: Send + Sync {
    /// Implementation name.
    fn name(&self) -> &'static str;

    /// Hand an fd to the waiter.
    fn enter(&self, waited: Waited) -> CoreResult<WaitToken>;

    /// Withdraw an entry before its callback runs. Returns false when the
    /// callback already fired or is being dispatched; the caller must
    /// then treat the fd's fate as decided by the callback.
    fn cancel(&self, token: WaitToken) -> bool;

    /// Number of fds currently waited on.
    fn waited(&self) -> usize;

    /// Set the die flag and wake the thread; it exits once the wait set
    /// drains. Blocks until the thread is gone.
    fn shutdown(&self);
}

/// Construct the waiter selected by `kind`.
pub fn new_waiter(
    kind: WaiterKind,
    arena: &Arc<Arena>,
    class: Arc<LockClass>,
) -> CoreResult<Arc<dyn Waiter>> {
    let stats: StatRef<WaiterStats> = StatRef::new_in(
        arena,
        "waiter",
        match kind {
            WaiterKind::Epoll => "epoll",
            WaiterKind::Poll => "poll",
        },
    )?;
    match kind {
        WaiterKind::Epoll => {
            let w: Arc<dyn Waiter> = EpollWaiter::new(class, stats)?;
            Ok(w)
        }
        WaiterKind::Poll => {
            let w: Arc<dyn Waiter> = PollWaiter::new(class, stats)?;
            Ok(w)
        }
    }
}

/// Sleep cap when the deadline heap is empty.
pub(crate) const IDLE_SLEEP: f64 = 100.0;

/// Self-pipe token, never allocated to an entry.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// One entry, shared between the heap, the token map and dispatch.
pub(crate) struct WaitEntry {
    pub token: WaitToken,
    pub fd: RawFd,
    pub deadline: f64,
    pub idx: AtomicU32,
    pub cb: parking_lot::Mutex<Option<WaitCallback>>,
}

impl HeapItem for Arc<WaitEntry> {
    fn heap_key(&self) -> f64 {
        self.deadline
    }
    fn heap_idx(&self) -> u32 {
        self.idx.load(Ordering::Relaxed)
    }
    fn set_heap_idx(&self, idx: u32) {
        self.idx.store(idx, Ordering::Relaxed);
    }
}

/// Shared bookkeeping under the waiter mutex.
pub(crate) struct WaitSet {
    pub heap: BinHeap<Arc<WaitEntry>>,
    pub entries: HashMap<WaitToken, Arc<WaitEntry>>,
    pub next_wake: f64,
}

impl WaitSet {
    pub(crate) fn new() -> WaitSet {
        WaitSet {
            heap: BinHeap::new(),
            entries: HashMap::new(),
            next_wake: 0.0,
        }
    }

    /// Detach an entry from both indexes; None if already dispatched.
    pub(crate) fn detach(&mut self, token: WaitToken) -> Option<Arc<WaitEntry>> {
        let entry = self.entries.remove(&token)?;
        let idx = entry.idx.load(Ordering::Relaxed);
        if idx != NOIDX {
            self.heap.delete(idx);
        }
        Some(entry)
    }
}

pub(crate) struct WaiterShared {
    pub set: Mtx<WaitSet>,
    pub stats: StatRef<WaiterStats>,
    pub next_token: AtomicU64,
}

impl WaiterShared {
    pub(crate) fn new(class: Arc<LockClass>, stats: StatRef<WaiterStats>) -> WaiterShared {
        WaiterShared {
            set: Mtx::new(class, WaitSet::new()),
            stats,
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn token(&self) -> WaitToken {
        let t = self.next_token.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(t, WAKE_TOKEN);
        t
    }

    /// Run an entry's callback with the right counter bumped.
    pub(crate) fn dispatch(&self, entry: &WaitEntry, reason: WaitReason, now: f64) {
        match reason {
            WaitReason::RemClose => self.stats.remclose.fetch_add(1, Ordering::Relaxed),
            WaitReason::Timeout => self.stats.timeout.fetch_add(1, Ordering::Relaxed),
            WaitReason::Action => self.stats.action.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(cb) = entry.cb.lock().take() {
            cb(reason, now);
        }
    }
}

/// Create the self-pipe, both ends non-blocking so a burst of wakeups
/// can never block a caller holding the waiter mutex.
pub(crate) fn wake_pipe() -> CoreResult<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    let (r, w) = nix::unistd::pipe().map_err(|e| waiter_error("pipe", e))?;
    for fd in [&r, &w] {
        fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| waiter_error("pipe O_NONBLOCK", e))?;
    }
    Ok((r, w))
}

/// Zero-byte peek means the remote end closed the connection.
pub(crate) fn peek_closed(fd: RawFd) -> bool {
    let mut b = 0u8;
    let r = unsafe {
        libc::recv(
            fd,
            &mut b as *mut u8 as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    r == 0
}

pub(crate) fn waiter_error(what: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::Waiter {
        reason: format!("{what}: {e}"),
    }
}
