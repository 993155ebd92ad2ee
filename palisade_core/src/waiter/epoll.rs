//! epoll-backed waiter (Linux).
//!
//! The scheduler thread owns the epoll fd. Entering threads arm the fd
//! under the waiter mutex and poke the self-pipe when the new deadline is
//! earlier than the scheduled wake, so the thread re-computes its sleep.

use super::{
    IDLE_SLEEP, WAKE_TOKEN, WaitEntry, WaitReason, WaitToken, Waited, Waiter, WaiterShared,
    peek_closed, waiter_error,
};
use crate::error::CoreResult;
use crate::heap::NOIDX;
use crate::sync::LockClass;
use palisade::vtim;
use palisade_shm::{StatRef, WaiterStats};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Events fetched per wait call.
const NEEV: usize = 256;

/// The epoll waiter.
pub struct EpollWaiter {
    shared: WaiterShared,
    epoll: Epoll,
    wake_r: OwnedFd,
    wake_w: OwnedFd,
    die: AtomicBool,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // The pool keeps waited fds open until callback or successful cancel.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl EpollWaiter {
    /// Create the waiter and start its scheduler thread.
    pub fn new(class: Arc<LockClass>, stats: StatRef<WaiterStats>) -> CoreResult<Arc<EpollWaiter>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| waiter_error("epoll_create", e))?;
        let (wake_r, wake_w) = super::wake_pipe()?;
        epoll
            .add(
                wake_r.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN),
            )
            .map_err(|e| waiter_error("epoll_add pipe", e))?;

        let w = Arc::new(EpollWaiter {
            shared: WaiterShared::new(class, stats),
            epoll,
            wake_r,
            wake_w,
            die: AtomicBool::new(false),
            thread: parking_lot::Mutex::new(None),
        });
        let me = Arc::clone(&w);
        let handle = std::thread::Builder::new()
            .name("cache-epoll".to_string())
            .spawn(move || me.run())
            .expect("spawn epoll waiter");
        *w.thread.lock() = Some(handle);
        Ok(w)
    }

    fn wake(&self) {
        let _ = unistd::write(&self.wake_w, b"X");
    }

    fn drain_pipe(&self) {
        let mut buf = [0u8; 64];
        let _ = unistd::read(&self.wake_r, &mut buf);
    }

    fn run(self: Arc<Self>) {
        let mut events = [EpollEvent::empty(); NEEV];
        let mut now = vtim::real_now();
        loop {
            // Fire everything past its deadline, then compute the sleep.
            let sleep_s;
            loop {
                let mut set = self.shared.set.lock();
                let due = set.heap.root().cloned();
                match due {
                    None => {
                        set.next_wake = now + IDLE_SLEEP;
                        sleep_s = IDLE_SLEEP;
                        break;
                    }
                    Some(e) if e.deadline > now => {
                        set.next_wake = e.deadline;
                        sleep_s = e.deadline - now;
                        break;
                    }
                    Some(e) => {
                        set.detach(e.token);
                        let _ = self.epoll.delete(borrow(e.fd));
                        self.shared.stats.conns.fetch_sub(1, Ordering::Relaxed);
                        drop(set);
                        self.shared.dispatch(&e, WaitReason::Timeout, now);
                    }
                }
            }

            let timeout = EpollTimeout::try_from(vtim::duration(sleep_s).max(
                std::time::Duration::from_millis(1),
            ))
            .unwrap_or(EpollTimeout::NONE);
            let n = loop {
                // epoll_wait can return EINTR under ptrace or on wake
                // from suspend; retry.
                match self.epoll.wait(&mut events, timeout) {
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "epoll_wait failed");
                        break 0;
                    }
                    Ok(n) => break n,
                }
            };
            now = vtim::real_now();

            for ev in &events[..n] {
                let token = ev.data();
                if token == WAKE_TOKEN {
                    self.drain_pipe();
                    continue;
                }
                let entry = {
                    let mut set = self.shared.set.lock();
                    match set.detach(token) {
                        Some(e) => {
                            let _ = self.epoll.delete(borrow(e.fd));
                            self.shared.stats.conns.fetch_sub(1, Ordering::Relaxed);
                            e
                        }
                        None => {
                            tracing::trace!(token, "spurious epoll event");
                            continue;
                        }
                    }
                };
                let flags = ev.events();
                let reason = if flags.contains(EpollFlags::EPOLLIN) {
                    if flags.contains(EpollFlags::EPOLLRDHUP) && peek_closed(entry.fd) {
                        WaitReason::RemClose
                    } else {
                        WaitReason::Action
                    }
                } else {
                    // EPOLLERR / EPOLLHUP / anything else
                    WaitReason::RemClose
                };
                self.shared.dispatch(&entry, reason, now);
            }

            if self.die.load(Ordering::Acquire) && self.waited() == 0 {
                break;
            }
        }
        tracing::info!("epoll waiter drained");
    }
}

impl Waiter for EpollWaiter {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn enter(&self, waited: Waited) -> CoreResult<WaitToken> {
        let token = self.shared.token();
        let entry = Arc::new(WaitEntry {
            token,
            fd: waited.fd,
            deadline: waited.deadline,
            idx: std::sync::atomic::AtomicU32::new(NOIDX),
            cb: parking_lot::Mutex::new(Some(waited.on_event)),
        });

        let mut set = self.shared.set.lock();
        self.epoll
            .add(
                borrow(waited.fd),
                EpollEvent::new(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
                    token,
                ),
            )
            .map_err(|e| waiter_error("epoll_add", e))?;
        set.heap.insert(Arc::clone(&entry));
        set.entries.insert(token, entry);
        self.shared.stats.conns.fetch_add(1, Ordering::Relaxed);
        // If the thread would sleep past this deadline, poke it.
        if waited.deadline < set.next_wake {
            self.wake();
        }
        Ok(token)
    }

    fn cancel(&self, token: WaitToken) -> bool {
        let mut set = self.shared.set.lock();
        match set.detach(token) {
            Some(e) => {
                let _ = self.epoll.delete(borrow(e.fd));
                self.shared.stats.conns.fetch_sub(1, Ordering::Relaxed);
                drop(set);
                // The thread may be blocked past the drained set; let it
                // re-evaluate (matters for shutdown).
                self.wake();
                true
            }
            None => false,
        }
    }

    fn waited(&self) -> usize {
        self.shared.set.lock().entries.len()
    }

    fn shutdown(&self) {
        self.die.store(true, Ordering::Release);
        self.wake();
        if let Some(h) = self.thread.lock().take() {
            let _ = h.join();
        }
    }
}
