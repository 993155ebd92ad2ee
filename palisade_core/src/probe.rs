//! Backend health probes.
//!
//! A probe is a dedicated thread doing a TCP connect check against its
//! backend's endpoint on a fixed period, keeping a sliding window of
//! results. The backend is probe-healthy when at least `threshold` of the
//! window succeeded. The probe holds its own reference on the pool so the
//! pool outlives the last served connection.

use crate::backend::Backend;
use crate::pool::TcpPool;
use palisade::vtim;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeDef {
    /// Period between checks, seconds.
    pub interval: f64,
    /// Connect timeout per check, seconds.
    pub timeout: f64,
    /// Results remembered (1..=64).
    pub window: u32,
    /// Good results required for healthy.
    pub threshold: u32,
}

impl ProbeDef {
    /// Defaults from the runtime parameters.
    pub fn from_params(p: &palisade::params::Params) -> ProbeDef {
        ProbeDef {
            interval: p.probe_interval,
            timeout: p.connect_timeout,
            window: p.probe_window,
            threshold: p.probe_threshold,
        }
    }
}

/// A running probe; stopping it joins the thread.
pub struct Probe {
    die: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Probe {
    /// Start probing `backend`. The probe keeps weak references to the
    /// backend (so deletion can proceed) but a strong one to the pool.
    pub fn start(backend: &Arc<Backend>, def: ProbeDef) -> Probe {
        let die = Arc::new(AtomicBool::new(false));
        let die2 = Arc::clone(&die);
        let weak: Weak<Backend> = Arc::downgrade(backend);
        let pool: Arc<TcpPool> = Arc::clone(&backend.pool);
        let name = backend.name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("probe-{name}"))
            .spawn(move || probe_loop(weak, pool, def, die2))
            .expect("spawn probe thread");
        Probe {
            die,
            thread: Some(thread),
        }
    }

    /// Stop the probe and wait for its thread.
    pub fn stop(mut self) {
        self.die.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.die.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

fn probe_loop(backend: Weak<Backend>, pool: Arc<TcpPool>, def: ProbeDef, die: Arc<AtomicBool>) {
    let window = def.window.clamp(1, 64);
    let mut bits: u64 = 0;
    let mut filled: u32 = 0;
    // Poll the die flag at a finer grain than the probe period so stop()
    // does not block for a full interval.
    let tick = def.interval.min(0.25).max(0.01);
    let mut next = vtim::mono_now();
    loop {
        if die.load(Ordering::Acquire) {
            break;
        }
        if vtim::mono_now() < next {
            vtim::sleep(tick);
            continue;
        }
        next = vtim::mono_now() + def.interval;

        let Some(be) = backend.upgrade() else {
            break;
        };
        let ok = check_once(&pool, def.timeout);
        bits = (bits << 1) | u64::from(ok);
        if filled < window {
            filled += 1;
        }
        let mask = if window == 64 {
            u64::MAX
        } else {
            (1u64 << window) - 1
        };
        let good = (bits & mask).count_ones();
        // Until the window fills, missing slots count as good so a fresh
        // backend is not born sick.
        let good = good + (window - filled);
        be.set_probe_result(good >= def.threshold, vtim::real_now());
    }
}

fn check_once(pool: &Arc<TcpPool>, timeout: f64) -> bool {
    for addr in pool.key().addrs() {
        if TcpStream::connect_timeout(&addr, vtim::duration(timeout)).is_ok() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKey;
    use crate::sync::LockClass;
    use palisade_shm::{Arena, MainStats, StatRef};
    use std::net::TcpListener;

    fn setup(addr: std::net::SocketAddr) -> (tempfile::TempDir, Arc<Backend>, Arc<dyn crate::waiter::Waiter>) {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 256 * 1024, 60.0).unwrap();
        let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "").unwrap();
        let wclass = LockClass::new(&arena, "waiter").unwrap();
        let pclass = LockClass::new(&arena, "pool").unwrap();
        let waiter =
            crate::waiter::new_waiter(palisade::params::WaiterKind::Poll, &arena, wclass).unwrap();
        let pool = TcpPool::new(
            PoolKey::from_addr(addr, "http"),
            Arc::clone(&waiter),
            stats,
            pclass,
            60.0,
            0,
        );
        let be = Backend::new("probed".to_string(), pool, vtim::real_now());
        (dir, be, waiter)
    }

    #[test]
    fn test_probe_marks_live_listener_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (_d, be, waiter) = setup(addr);

        let probe = Probe::start(
            &be,
            ProbeDef {
                interval: 0.05,
                timeout: 0.5,
                window: 4,
                threshold: 3,
            },
        );
        vtim::sleep(0.4);
        assert!(be.is_healthy());
        probe.stop();
        waiter.shutdown();
    }

    #[test]
    fn test_probe_marks_dead_endpoint_sick() {
        // Bind then drop: the port is (very likely) closed.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_d, be, waiter) = setup(addr);

        let probe = Probe::start(
            &be,
            ProbeDef {
                interval: 0.05,
                timeout: 0.2,
                window: 4,
                threshold: 3,
            },
        );
        vtim::sleep(0.8);
        assert!(!be.is_healthy());
        probe.stop();
        waiter.shutdown();
    }
}
