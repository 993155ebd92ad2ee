//! Named upstream backends.
//!
//! A backend couples an endpoint's TCP pool with an administrative
//! health state and an optional probe. Deleting a backend never yanks it
//! from under in-flight requests: it moves to a cooling list for at least
//! the configured cooling interval, and the sweep only drops entries
//! whose stamp has passed.

use crate::pool::{PoolKey, TcpPool};
use crate::probe::{Probe, ProbeDef};
use crate::sync::{LockClass, Mtx};
use palisade_shm::{MainStats, StatRef};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Administrative health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminHealth {
    /// Forced healthy.
    Healthy = 0,
    /// Forced sick.
    Sick = 1,
    /// Defer to the probe (healthy when no probe is configured).
    Auto = 2,
    /// Deleted; reachable only by in-flight requests.
    Deleted = 3,
}

impl AdminHealth {
    fn from_u8(v: u8) -> AdminHealth {
        match v {
            0 => AdminHealth::Healthy,
            1 => AdminHealth::Sick,
            2 => AdminHealth::Auto,
            _ => AdminHealth::Deleted,
        }
    }
}

#[inline]
fn f2b(v: f64) -> u64 {
    v.to_bits()
}

#[inline]
fn b2f(b: u64) -> f64 {
    f64::from_bits(b)
}

/// Definition used to create a backend.
#[derive(Debug, Clone)]
pub struct BackendDef {
    /// Unique name.
    pub name: String,
    /// IPv4 endpoint.
    pub v4: Option<std::net::SocketAddr>,
    /// IPv6 endpoint.
    pub v6: Option<std::net::SocketAddr>,
    /// Protocol tag for pool sharing.
    pub proto: String,
    /// Optional health probe.
    pub probe: Option<ProbeDef>,
}

/// A named upstream.
pub struct Backend {
    /// Unique name.
    pub name: String,
    /// The shared connection pool.
    pub pool: Arc<TcpPool>,
    admin: AtomicU8,
    probe_ok: AtomicBool,
    has_probe: AtomicBool,
    health_changed: AtomicU64,
    became_healthy: AtomicU64,
}

impl Backend {
    pub(crate) fn new(name: String, pool: Arc<TcpPool>, now: f64) -> Arc<Backend> {
        Arc::new(Backend {
            name,
            pool,
            admin: AtomicU8::new(AdminHealth::Auto as u8),
            probe_ok: AtomicBool::new(true),
            has_probe: AtomicBool::new(false),
            health_changed: AtomicU64::new(f2b(now)),
            became_healthy: AtomicU64::new(f2b(now)),
        })
    }

    /// Administrative health state.
    pub fn admin_health(&self) -> AdminHealth {
        AdminHealth::from_u8(self.admin.load(Ordering::Acquire))
    }

    /// Change the administrative state.
    pub fn set_admin_health(&self, h: AdminHealth, now: f64) {
        let prev = self.admin.swap(h as u8, Ordering::AcqRel);
        if prev != h as u8 {
            self.note_health_change(now);
        }
    }

    pub(crate) fn set_probe_result(&self, healthy: bool, now: f64) {
        self.has_probe.store(true, Ordering::Relaxed);
        let prev = self.probe_ok.swap(healthy, Ordering::AcqRel);
        if prev != healthy {
            self.note_health_change(now);
            tracing::info!(
                backend = %self.name,
                healthy,
                "probe health transition"
            );
        }
    }

    fn note_health_change(&self, now: f64) {
        self.health_changed.store(f2b(now), Ordering::Release);
        if self.is_healthy() {
            self.became_healthy.store(f2b(now), Ordering::Release);
        }
    }

    /// Merged health: admin state first, probe result under `Auto`.
    pub fn is_healthy(&self) -> bool {
        match self.admin_health() {
            AdminHealth::Healthy => true,
            AdminHealth::Sick | AdminHealth::Deleted => false,
            AdminHealth::Auto => {
                !self.has_probe.load(Ordering::Relaxed) || self.probe_ok.load(Ordering::Acquire)
            }
        }
    }

    /// When the merged health last changed.
    pub fn health_changed(&self) -> f64 {
        b2f(self.health_changed.load(Ordering::Acquire))
    }

    /// When the backend last became healthy (shard rampup anchor).
    pub fn became_healthy(&self) -> f64 {
        b2f(self.became_healthy.load(Ordering::Acquire))
    }
}

struct Registry {
    live: Vec<(Arc<Backend>, Option<Probe>)>,
    cooling: Vec<(f64, Arc<Backend>)>,
}

/// The backend registry with its cooling list.
pub struct BackendRegistry {
    stats: StatRef<MainStats>,
    cool_duration: f64,
    mtx: Mtx<Registry>,
}

impl BackendRegistry {
    /// Create the registry.
    pub fn new(
        stats: StatRef<MainStats>,
        class: Arc<LockClass>,
        cool_duration: f64,
    ) -> BackendRegistry {
        BackendRegistry {
            stats,
            cool_duration,
            mtx: Mtx::new(class, Registry {
                live: Vec::new(),
                cooling: Vec::new(),
            }),
        }
    }

    /// Register a backend; the caller supplies the interned pool.
    pub fn insert(&self, backend: Arc<Backend>, probe: Option<Probe>) {
        let mut reg = self.mtx.lock();
        reg.live.push((Arc::clone(&backend), probe));
        self.stats.n_backend.fetch_add(1, Ordering::Relaxed);
    }

    /// Look up a live backend by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Backend>> {
        self.mtx
            .lock()
            .live
            .iter()
            .find(|(b, _)| b.name == name)
            .map(|(b, _)| Arc::clone(b))
    }

    /// Names of live backends.
    pub fn names(&self) -> Vec<String> {
        self.mtx
            .lock()
            .live
            .iter()
            .map(|(b, _)| b.name.clone())
            .collect()
    }

    /// Delete a backend: admin state `Deleted`, probe stopped, entry
    /// moved to the cooling list for at least the cooling interval.
    pub fn delete(&self, name: &str, now: f64) -> bool {
        let mut reg = self.mtx.lock();
        let Some(pos) = reg.live.iter().position(|(b, _)| b.name == name) else {
            return false;
        };
        let (backend, probe) = reg.live.remove(pos);
        backend.set_admin_health(AdminHealth::Deleted, now);
        if let Some(p) = probe {
            p.stop();
        }
        reg.cooling.push((now + self.cool_duration, backend));
        self.stats.n_backend.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Drop cooled entries. Runs on the expiry tick.
    pub fn sweep(&self, now: f64) {
        let mut reg = self.mtx.lock();
        reg.cooling.retain(|(until, _)| *until > now);
    }

    /// Entries still cooling, for tests and introspection.
    pub fn cooling_count(&self) -> usize {
        self.mtx.lock().cooling.len()
    }

    /// Stop every probe (shutdown path).
    pub fn stop_probes(&self) {
        let mut reg = self.mtx.lock();
        for (_, probe) in reg.live.iter_mut() {
            if let Some(p) = probe.take() {
                p.stop();
            }
        }
    }

    /// Drain idle pool connections of every live backend (shutdown path).
    pub fn drain_pools(&self) {
        let pools: Vec<Arc<TcpPool>> = self
            .mtx
            .lock()
            .live
            .iter()
            .map(|(b, _)| Arc::clone(&b.pool))
            .collect();
        for p in pools {
            p.drain();
        }
    }
}

/// Default key for a backend definition.
pub fn pool_key_for(def: &BackendDef) -> PoolKey {
    PoolKey {
        v4: def.v4,
        v6: def.v6,
        proto: def.proto.clone(),
    }
}
