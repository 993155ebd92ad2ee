//! Backend TCP connection pools.
//!
//! One pool per upstream endpoint, keyed by the address pair and a
//! protocol tag, shared by every director that names the same endpoint.
//! Idle keepalive connections sit in the waiter; a worker taking one
//! withdraws it, and a worker that cannot get a connection parks on the
//! pool condvar until a recycle hands one over directly.
//!
//! Conservation: every [`TcpPool::get`] is followed by exactly one
//! [`TcpPool::recycle`] or [`TcpPool::close`] - the connection is a move-
//! only value, so the compiler enforces it.

use crate::error::{CoreError, CoreResult};
use crate::sync::{Cond, LockClass, Mtx};
use crate::waiter::{WaitReason, WaitToken, Waited, Waiter};
use palisade::vtim;
use palisade_shm::{MainStats, StatRef};
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pool identity: the ordered address pair plus a protocol tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// IPv4 endpoint, if any.
    pub v4: Option<SocketAddr>,
    /// IPv6 endpoint, if any.
    pub v6: Option<SocketAddr>,
    /// Protocol identity tag (e.g. "http").
    pub proto: String,
}

impl PoolKey {
    /// Key for a single-address endpoint.
    pub fn from_addr(addr: SocketAddr, proto: &str) -> PoolKey {
        match addr {
            SocketAddr::V4(_) => PoolKey {
                v4: Some(addr),
                v6: None,
                proto: proto.to_string(),
            },
            SocketAddr::V6(_) => PoolKey {
                v4: None,
                v6: Some(addr),
                proto: proto.to_string(),
            },
        }
    }

    /// Connect order: v4 first, then v6.
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.v4.iter().chain(self.v6.iter()).copied()
    }
}

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// In the idle queue, armed in the waiter.
    Available,
    /// Exclusively owned by a worker.
    InUse,
    /// Handed directly from recycle to a parked worker.
    Stolen,
    /// Being closed by the waiter callback.
    Cleanup,
}

/// A pooled backend connection, exclusively owned between get and
/// recycle/close.
pub struct PooledConn {
    /// The socket.
    pub stream: TcpStream,
    /// Peer address actually connected.
    pub peer: SocketAddr,
    state: ConnState,
    id: u64,
}

impl PooledConn {
    /// Current state tag.
    pub fn state(&self) -> ConnState {
        self.state
    }
}

struct IdleConn {
    conn: PooledConn,
    token: WaitToken,
}

struct PoolInner {
    n_conn: u32,
    n_waiting: u32,
    available: VecDeque<IdleConn>,
    handoff: Option<PooledConn>,
}

/// A per-endpoint connection pool.
pub struct TcpPool {
    key: PoolKey,
    waiter: Arc<dyn Waiter>,
    stats: StatRef<MainStats>,
    idle_timeout: f64,
    max_conns: u32,
    next_conn_id: AtomicU64,
    mtx: Mtx<PoolInner>,
    cond: Cond,
}

impl TcpPool {
    /// Create a pool. Normally called through the runtime's registry so
    /// pools are shared by key.
    pub fn new(
        key: PoolKey,
        waiter: Arc<dyn Waiter>,
        stats: StatRef<MainStats>,
        class: Arc<LockClass>,
        idle_timeout: f64,
        max_conns: u32,
    ) -> Arc<TcpPool> {
        stats.n_pool.fetch_add(1, Ordering::Relaxed);
        Arc::new(TcpPool {
            key,
            waiter,
            stats,
            idle_timeout,
            max_conns,
            next_conn_id: AtomicU64::new(1),
            mtx: Mtx::new(Arc::clone(&class), PoolInner {
                n_conn: 0,
                n_waiting: 0,
                available: VecDeque::new(),
                handoff: None,
            }),
            cond: Cond::new(class),
        })
    }

    /// The pool's identity.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Idle connections currently queued.
    pub fn idle_count(&self) -> usize {
        self.mtx.lock().available.len()
    }

    /// Connections currently accounted to this pool.
    pub fn conn_count(&self) -> u32 {
        self.mtx.lock().n_conn
    }

    fn connect(&self, tmo: f64) -> CoreResult<PooledConn> {
        let mut last: Option<std::io::Error> = None;
        for addr in self.key.addrs() {
            match TcpStream::connect_timeout(&addr, vtim::duration(tmo)) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.stats.pool_conn_opened.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledConn {
                        stream,
                        peer: addr,
                        state: ConnState::InUse,
                        id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
                    });
                }
                Err(e) => last = Some(e),
            }
        }
        Err(CoreError::NoConnection {
            reason: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| "endpoint has no address".to_string()),
        })
    }

    /// Obtain a connection: reuse idle, open fresh, or park until a
    /// recycle hands one over (`wait_tmo` bounds the park).
    pub fn get(self: &Arc<Self>, connect_tmo: f64, wait_tmo: f64) -> CoreResult<PooledConn> {
        let mut inner = self.mtx.lock();

        // Idle first. Losing the cancel race means the waiter callback
        // already decided the connection's fate, so it is gone.
        while let Some(idle) = inner.available.pop_front() {
            if self.waiter.cancel(idle.token) {
                let mut conn = idle.conn;
                conn.state = ConnState::InUse;
                self.stats.pool_conn_reused.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
            inner.n_conn -= 1;
            self.stats.pool_conn_closed.fetch_add(1, Ordering::Relaxed);
            drop(idle.conn);
        }

        if self.max_conns == 0 || inner.n_conn < self.max_conns {
            inner.n_conn += 1;
            drop(inner);
            return match self.connect(connect_tmo) {
                Ok(c) => Ok(c),
                Err(e) => {
                    let mut inner = self.mtx.lock();
                    inner.n_conn -= 1;
                    if inner.n_waiting > 0 {
                        self.cond.notify_one();
                    }
                    Err(e)
                }
            };
        }

        // At the ceiling: park until recycle or close wakes us.
        inner.n_waiting += 1;
        let deadline = vtim::mono_now() + wait_tmo;
        loop {
            if let Some(mut conn) = inner.handoff.take() {
                inner.n_waiting -= 1;
                conn.state = ConnState::InUse;
                self.stats.pool_conn_stolen.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
            if inner.n_conn < self.max_conns {
                // A close freed a slot.
                inner.n_waiting -= 1;
                inner.n_conn += 1;
                drop(inner);
                return match self.connect(connect_tmo) {
                    Ok(c) => Ok(c),
                    Err(e) => {
                        let mut inner = self.mtx.lock();
                        inner.n_conn -= 1;
                        if inner.n_waiting > 0 {
                            self.cond.notify_one();
                        }
                        Err(e)
                    }
                };
            }
            let remaining = deadline - vtim::mono_now();
            if remaining <= 0.0 {
                inner.n_waiting -= 1;
                self.stats.pool_wait_timeout.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::PoolWaitTimeout);
            }
            self.cond.wait_for(&mut inner, vtim::duration(remaining));
        }
    }

    /// Return a connection for keepalive. A parked worker steals it
    /// directly; otherwise it joins the idle queue with a waiter
    /// deadline.
    pub fn recycle(self: &Arc<Self>, mut conn: PooledConn) {
        let now = vtim::real_now();
        let mut inner = self.mtx.lock();

        if inner.n_waiting > 0 && inner.handoff.is_none() {
            conn.state = ConnState::Stolen;
            inner.handoff = Some(conn);
            self.cond.notify_one();
            return;
        }

        conn.state = ConnState::Available;
        let fd = conn.stream.as_raw_fd();
        let id = conn.id;
        let me = Arc::clone(self);
        let waited = Waited {
            fd,
            deadline: now + self.idle_timeout,
            on_event: Box::new(move |reason, _now| me.reap(id, reason)),
        };
        match self.waiter.enter(waited) {
            Ok(token) => {
                inner.available.push_back(IdleConn { conn, token });
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot arm idle connection, closing");
                inner.n_conn -= 1;
                self.stats.pool_conn_closed.fetch_add(1, Ordering::Relaxed);
                if inner.n_waiting > 0 {
                    self.cond.notify_one();
                }
                drop(inner);
                drop(conn);
            }
        }
    }

    /// Force-close a connection and free its slot.
    pub fn close(self: &Arc<Self>, mut conn: PooledConn) {
        conn.state = ConnState::Cleanup;
        let mut inner = self.mtx.lock();
        inner.n_conn -= 1;
        self.stats.pool_conn_closed.fetch_add(1, Ordering::Relaxed);
        if inner.n_waiting > 0 {
            self.cond.notify_one();
        }
        drop(inner);
        drop(conn);
    }

    /// Waiter callback for an idle connection: close it unless a worker
    /// already took it out of the queue.
    fn reap(self: &Arc<Self>, id: u64, reason: WaitReason) {
        let mut inner = self.mtx.lock();
        let Some(pos) = inner.available.iter().position(|i| i.conn.id == id) else {
            return;
        };
        let mut idle = inner.available.remove(pos).expect("position valid");
        idle.conn.state = ConnState::Cleanup;
        inner.n_conn -= 1;
        self.stats.pool_conn_closed.fetch_add(1, Ordering::Relaxed);
        if inner.n_waiting > 0 {
            self.cond.notify_one();
        }
        drop(inner);
        tracing::debug!(id, ?reason, peer = %idle.conn.peer, "idle connection reaped");
        drop(idle.conn);
    }

    /// Close every idle connection (shutdown path, before the waiter
    /// drains).
    pub fn drain(self: &Arc<Self>) {
        let mut inner = self.mtx.lock();
        while let Some(idle) = inner.available.pop_front() {
            let _ = self.waiter.cancel(idle.token);
            inner.n_conn -= 1;
            self.stats.pool_conn_closed.fetch_add(1, Ordering::Relaxed);
            drop(idle.conn);
        }
    }
}

impl Drop for TcpPool {
    fn drop(&mut self) {
        self.stats.n_pool.fetch_sub(1, Ordering::Relaxed);
    }
}
