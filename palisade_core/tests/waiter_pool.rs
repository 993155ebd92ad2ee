//! Waiter and pool behavior over real sockets.

use palisade::params::{Params, WaiterKind};
use palisade::vtim;
use palisade_core::{CoreError, PoolKey, Runtime, WaitReason, Waited};
use palisade_shm::Arena;
use palisade_core::sync::LockClass;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;

fn mk_waiter(kind: WaiterKind) -> (tempfile::TempDir, Arc<dyn palisade_core::Waiter>) {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::create(dir.path(), 256 * 1024, 60.0).unwrap();
    let class = LockClass::new(&arena, "waiter").unwrap();
    let w = palisade_core::new_waiter(kind, &arena, class).unwrap();
    (dir, w)
}

fn sock_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let a = TcpStream::connect(addr).unwrap();
    let (b, _) = listener.accept().unwrap();
    (a, b)
}

fn waiter_kinds() -> Vec<WaiterKind> {
    vec![WaiterKind::Epoll, WaiterKind::Poll]
}

#[test]
fn test_timeout_fires_exactly_once_near_deadline() {
    for kind in waiter_kinds() {
        let (_d, w) = mk_waiter(kind);
        let (a, _b) = sock_pair();
        let fired = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();

        let t0 = vtim::real_now();
        let fired2 = Arc::clone(&fired);
        w.enter(Waited {
            fd: a.as_raw_fd(),
            deadline: t0 + 0.5,
            on_event: Box::new(move |reason, now| {
                assert_eq!(reason, WaitReason::Timeout);
                fired2.fetch_add(1, Ordering::SeqCst);
                tx.send(now).unwrap();
            }),
        })
        .unwrap();

        let fired_at = rx.recv_timeout(std::time::Duration::from_secs(3)).unwrap();
        assert!(
            (fired_at - t0 - 0.5).abs() < 0.25,
            "timeout fired {}s after enter",
            fired_at - t0
        );
        // No second callback.
        vtim::sleep(0.2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(w.waited(), 0);
        w.shutdown();
    }
}

#[test]
fn test_action_on_data_arrival() {
    for kind in waiter_kinds() {
        let (_d, w) = mk_waiter(kind);
        let (a, b) = sock_pair();
        let (tx, rx) = mpsc::channel();

        w.enter(Waited {
            fd: a.as_raw_fd(),
            deadline: vtim::real_now() + 10.0,
            on_event: Box::new(move |reason, _| tx.send(reason).unwrap()),
        })
        .unwrap();

        use std::io::Write;
        (&b).write_all(b"x").unwrap();

        let reason = rx.recv_timeout(std::time::Duration::from_secs(3)).unwrap();
        assert_eq!(reason, WaitReason::Action);
        w.shutdown();
    }
}

#[test]
fn test_remclose_on_peer_close() {
    for kind in waiter_kinds() {
        let (_d, w) = mk_waiter(kind);
        let (a, b) = sock_pair();
        let (tx, rx) = mpsc::channel();

        w.enter(Waited {
            fd: a.as_raw_fd(),
            deadline: vtim::real_now() + 10.0,
            on_event: Box::new(move |reason, _| tx.send(reason).unwrap()),
        })
        .unwrap();

        drop(b);

        let reason = rx.recv_timeout(std::time::Duration::from_secs(3)).unwrap();
        assert_eq!(reason, WaitReason::RemClose);
        w.shutdown();
    }
}

#[test]
fn test_cancel_before_fire_wins_once() {
    for kind in waiter_kinds() {
        let (_d, w) = mk_waiter(kind);
        let (a, _b) = sock_pair();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);

        let token = w
            .enter(Waited {
                fd: a.as_raw_fd(),
                deadline: vtim::real_now() + 0.3,
                on_event: Box::new(move |_, _| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
            })
            .unwrap();

        assert!(w.cancel(token), "cancel before the deadline succeeds");
        assert!(!w.cancel(token), "second cancel finds nothing");
        vtim::sleep(0.6);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "no callback after cancel");
        assert_eq!(w.waited(), 0);
        w.shutdown();
    }
}

#[test]
fn test_early_deadline_shortens_sleep() {
    for kind in waiter_kinds() {
        let (_d, w) = mk_waiter(kind);
        let (a, _ka) = sock_pair();
        let (b, _kb) = sock_pair();
        let (tx, rx) = mpsc::channel();

        // First a long deadline so the thread schedules a far wake...
        let long_token = w
            .enter(Waited {
                fd: a.as_raw_fd(),
                deadline: vtim::real_now() + 50.0,
                on_event: Box::new(|_, _| {}),
            })
            .unwrap();
        vtim::sleep(0.1);
        // ...then a near one; the self-pipe must reschedule the sleep.
        let t0 = vtim::real_now();
        w.enter(Waited {
            fd: b.as_raw_fd(),
            deadline: t0 + 0.3,
            on_event: Box::new(move |reason, now| {
                assert_eq!(reason, WaitReason::Timeout);
                tx.send(now).unwrap();
            }),
        })
        .unwrap();

        let fired_at = rx.recv_timeout(std::time::Duration::from_secs(3)).unwrap();
        assert!((fired_at - t0 - 0.3).abs() < 0.25);
        assert_eq!(w.waited(), 1);
        // The waiter only exits once its set drains.
        assert!(w.cancel(long_token));
        w.shutdown();
    }
}

fn mk_runtime(max_conns: u32, idle_timeout: f64) -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().unwrap();
    let mut params = Params::default();
    params.max_pool_conns = max_conns;
    params.backend_idle_timeout = idle_timeout;
    params.expiry_sleep = 0.1;
    let rt = Runtime::new(params, dir.path()).unwrap();
    (dir, rt)
}

#[test]
fn test_pool_reuse_and_idle_count() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (_d, rt) = mk_runtime(0, 60.0);
    let pool = rt.pool_ref(PoolKey::from_addr(addr, "http"));

    let c1 = pool.get(1.0, 1.0).unwrap();
    assert_eq!(pool.conn_count(), 1);
    assert_eq!(pool.idle_count(), 0);

    pool.recycle(c1);
    assert_eq!(pool.idle_count(), 1);

    let _c2 = pool.get(1.0, 1.0).unwrap();
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.conn_count(), 1, "reused, not reopened");
    assert_eq!(
        rt.stats.pool_conn_reused.load(Ordering::Relaxed),
        1
    );
    pool.close(_c2);
    assert_eq!(pool.conn_count(), 0);
    rt.shutdown();
}

#[test]
fn test_pool_steal_on_recycle() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (_d, rt) = mk_runtime(1, 60.0);
    let pool = rt.pool_ref(PoolKey::from_addr(addr, "http"));

    // T1 holds the only permitted connection.
    let c = pool.get(1.0, 1.0).unwrap();

    // T2 parks.
    let pool2 = Arc::clone(&pool);
    let t2 = std::thread::spawn(move || pool2.get(1.0, 5.0));

    // Give T2 time to park, then recycle: the connection must be handed
    // over directly, never touching the idle queue.
    vtim::sleep(0.3);
    pool.recycle(c);

    let got = t2.join().unwrap().unwrap();
    assert_eq!(pool.idle_count(), 0, "stolen connections bypass the queue");
    assert_eq!(rt.stats.pool_conn_stolen.load(Ordering::Relaxed), 1);
    pool.close(got);
    rt.shutdown();
}

#[test]
fn test_pool_wait_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (_d, rt) = mk_runtime(1, 60.0);
    let pool = rt.pool_ref(PoolKey::from_addr(addr, "http"));

    let c = pool.get(1.0, 1.0).unwrap();
    let r = pool.get(1.0, 0.3);
    assert!(matches!(r, Err(CoreError::PoolWaitTimeout)));
    assert_eq!(rt.stats.pool_wait_timeout.load(Ordering::Relaxed), 1);
    pool.close(c);
    rt.shutdown();
}

#[test]
fn test_pool_idle_keepalive_reaped() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (_d, rt) = mk_runtime(0, 0.3);
    let pool = rt.pool_ref(PoolKey::from_addr(addr, "http"));

    let c = pool.get(1.0, 1.0).unwrap();
    pool.recycle(c);
    assert_eq!(pool.idle_count(), 1);

    vtim::sleep(0.9);
    assert_eq!(pool.idle_count(), 0, "idle deadline closed the connection");
    assert_eq!(pool.conn_count(), 0);
    rt.shutdown();
}

#[test]
fn test_pool_connect_failure() {
    // Bind then drop: nobody listens there anymore.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (_d, rt) = mk_runtime(0, 60.0);
    let pool = rt.pool_ref(PoolKey::from_addr(addr, "http"));
    let r = pool.get(0.5, 0.5);
    assert!(matches!(r, Err(CoreError::NoConnection { .. })));
    assert_eq!(pool.conn_count(), 0, "failed connect releases its slot");
    rt.shutdown();
}

#[test]
fn test_pool_interning_by_key() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (_d, rt) = mk_runtime(0, 60.0);

    let p1 = rt.pool_ref(PoolKey::from_addr(addr, "http"));
    let p2 = rt.pool_ref(PoolKey::from_addr(addr, "http"));
    assert!(Arc::ptr_eq(&p1, &p2), "same key, same pool");

    let p3 = rt.pool_ref(PoolKey::from_addr(addr, "other-proto"));
    assert!(!Arc::ptr_eq(&p1, &p3), "proto tag separates pools");
    rt.shutdown();
}
