//! poll(2) fallback waiter.
//!
//! Portable but not cheap: the pollfd vector is rebuilt on every loop.
//! Same contract as the epoll waiter; only the event facility differs.

use super::{
    IDLE_SLEEP, WaitEntry, WaitReason, WaitToken, Waited, Waiter, WaiterShared, peek_closed,
    waiter_error,
};
use crate::error::CoreResult;
use crate::heap::NOIDX;
use crate::sync::LockClass;
use palisade::vtim;
use palisade_shm::{StatRef, WaiterStats};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// The poll waiter.
pub struct PollWaiter {
    shared: WaiterShared,
    wake_r: OwnedFd,
    wake_w: OwnedFd,
    die: AtomicBool,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl PollWaiter {
    /// Create the waiter and start its scheduler thread.
    pub fn new(class: Arc<LockClass>, stats: StatRef<WaiterStats>) -> CoreResult<Arc<PollWaiter>> {
        let (wake_r, wake_w) = super::wake_pipe()?;
        let w = Arc::new(PollWaiter {
            shared: WaiterShared::new(class, stats),
            wake_r,
            wake_w,
            die: AtomicBool::new(false),
            thread: parking_lot::Mutex::new(None),
        });
        let me = Arc::clone(&w);
        let handle = std::thread::Builder::new()
            .name("cache-poll".to_string())
            .spawn(move || me.run())
            .expect("spawn poll waiter");
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
        let mut now = vtim::real_now();
        loop {
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
                        self.shared.stats.conns.fetch_sub(1, Ordering::Relaxed);
                        drop(set);
                        self.shared.dispatch(&e, WaitReason::Timeout, now);
                    }
                }
            }

            // Snapshot the fd set; poll() gets its own vector each loop.
            let watched: Vec<(WaitToken, RawFd)> = {
                let set = self.shared.set.lock();
                set.entries.values().map(|e| (e.token, e.fd)).collect()
            };

            let mut pfds = Vec::with_capacity(watched.len() + 1);
            pfds.push(PollFd::new(self.wake_r.as_fd(), PollFlags::POLLIN));
            for (_, fd) in &watched {
                pfds.push(PollFd::new(borrow(*fd), PollFlags::POLLIN));
            }

            let timeout = PollTimeout::try_from(
                vtim::duration(sleep_s).max(std::time::Duration::from_millis(1)),
            )
            .unwrap_or(PollTimeout::MAX);
            let n = loop {
                match poll(&mut pfds, timeout) {
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "poll failed");
                        break 0;
                    }
                    Ok(n) => break n,
                }
            };
            now = vtim::real_now();

            if n > 0 {
                let revents: Vec<Option<PollFlags>> =
                    pfds.iter().map(|p| p.revents()).collect();
                drop(pfds);

                if revents[0].is_some_and(|r| r.contains(PollFlags::POLLIN)) {
                    self.drain_pipe();
                }
                for (i, (token, fd)) in watched.iter().enumerate() {
                    let Some(r) = revents[i + 1] else { continue };
                    if r.is_empty() {
                        continue;
                    }
                    let entry = {
                        let mut set = self.shared.set.lock();
                        match set.detach(*token) {
                            Some(e) => {
                                self.shared.stats.conns.fetch_sub(1, Ordering::Relaxed);
                                e
                            }
                            None => continue, // cancelled while polling
                        }
                    };
                    let reason = if r.contains(PollFlags::POLLIN) {
                        if peek_closed(*fd) {
                            WaitReason::RemClose
                        } else {
                            WaitReason::Action
                        }
                    } else {
                        WaitReason::RemClose
                    };
                    self.shared.dispatch(&entry, reason, now);
                }
            }

            if self.die.load(Ordering::Acquire) && self.waited() == 0 {
                break;
            }
        }
        tracing::info!("poll waiter drained");
    }
}

impl Waiter for PollWaiter {
    fn name(&self) -> &'static str {
        "poll"
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
        set.heap.insert(Arc::clone(&entry));
        set.entries.insert(token, entry);
        self.shared.stats.conns.fetch_add(1, Ordering::Relaxed);
        drop(set);
        // The fd set changed; the polling thread must rebuild it.
        self.wake();
        Ok(token)
    }

    fn cancel(&self, token: WaitToken) -> bool {
        let mut set = self.shared.set.lock();
        match set.detach(token) {
            Some(_) => {
                self.shared.stats.conns.fetch_sub(1, Ordering::Relaxed);
                drop(set);
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
