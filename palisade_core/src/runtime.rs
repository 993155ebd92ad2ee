//! The process-scope service handle.
//!
//! Everything that is legitimately singleton in one cache process - the
//! arena, the ring log, the expiry heap, the waiter, the pool and backend
//! registries - hangs off one explicit `Runtime` value instead of hidden
//! globals, so a test binary can run several runtimes side by side.

use crate::backend::{Backend, BackendDef, BackendRegistry, pool_key_for};
use crate::error::CoreResult;
use crate::expire::ExpiryEngine;
use crate::net::Timeouts;
use crate::panicdump::{self, PanicRegion};
use crate::pool::{PoolKey, TcpPool};
use crate::probe::Probe;
use crate::sync::LockClass;
use crate::waiter::{Waiter, new_waiter};
use crate::ws::{Ctx, Ws};
use palisade::params::Params;
use palisade::vtim;
use palisade_shm::{Arena, MainStats, StatRef, Vsl};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Extra arena bytes beyond the ring for stats rows and the panic dump.
const ARENA_SLACK: usize = 512 * 1024;

/// First transaction id handed out.
const XID_BASE: u64 = 1000;

/// The assembled data-plane runtime.
pub struct Runtime {
    /// Tunables this runtime was built with.
    pub params: Params,
    /// The shared-memory arena.
    pub arena: Arc<Arena>,
    /// Process-wide counters.
    pub stats: StatRef<MainStats>,
    /// The ring log.
    pub vsl: Arc<Vsl>,
    /// The expiry engine (its thread runs after `new`).
    pub expiry: Arc<ExpiryEngine>,
    /// The fd waiter.
    pub waiter: Arc<dyn Waiter>,
    /// Backends and their cooling list.
    pub backends: BackendRegistry,
    pools: parking_lot::Mutex<HashMap<PoolKey, Weak<TcpPool>>>,
    classes: parking_lot::Mutex<HashMap<&'static str, Arc<LockClass>>>,
    pool_class: Arc<LockClass>,
    timeouts: Timeouts,
    xid: AtomicU64,
}

impl Runtime {
    /// Build the runtime: arena under `dir`, services started.
    pub fn new(params: Params, dir: &Path) -> CoreResult<Arc<Runtime>> {
        params.validate()?;

        let arena = Arena::create(dir, params.vsl_space + ARENA_SLACK, params.cool_duration)?;
        let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "")?;
        let vsl = Vsl::new(&arena, stats.clone(), &params)?;

        let exp_class = LockClass::new(&arena, "exp")?;
        let lru_class = LockClass::new(&arena, "lru")?;
        let waiter_class = LockClass::new(&arena, "waiter")?;
        let pool_class = LockClass::new(&arena, "pool")?;
        let backend_class = LockClass::new(&arena, "backend")?;

        let waiter = new_waiter(params.waiter_type, &arena, waiter_class)?;
        let expiry = ExpiryEngine::new(
            &arena,
            stats.clone(),
            Arc::clone(&vsl),
            exp_class,
            lru_class,
            params.default_grace,
            params.expiry_sleep,
        );
        let backends = BackendRegistry::new(stats.clone(), backend_class, params.cool_duration);

        let timeouts = Timeouts::from_params(&params);
        let rt = Arc::new(Runtime {
            params,
            arena,
            stats,
            vsl,
            expiry,
            waiter,
            backends,
            pools: parking_lot::Mutex::new(HashMap::new()),
            classes: parking_lot::Mutex::new(HashMap::new()),
            pool_class,
            timeouts,
            xid: AtomicU64::new(XID_BASE),
        });

        // The expiry thread doubles as the housekeeping tick: arena age
        // (done by the engine itself) and the backend cooling sweep.
        let weak = Arc::downgrade(&rt);
        rt.expiry.on_tick(Box::new(move |now| {
            if let Some(rt) = weak.upgrade() {
                rt.backends.sweep(now);
            }
        }));
        rt.expiry.start();

        tracing::info!(waiter = rt.waiter.name(), "runtime up");
        Ok(rt)
    }

    /// Configured IO timeouts.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Allocate the next transaction id.
    pub fn next_xid(&self) -> u64 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a per-request context.
    pub fn ctx(&self) -> Ctx {
        Ctx::new(
            self.next_xid(),
            vtim::real_now(),
            Ws::new(self.params.workspace_session, Some(self.stats.clone())),
            self.vsl.buffer(),
        )
    }

    /// Get or create a named lock class.
    pub fn lock_class(&self, name: &'static str) -> Arc<LockClass> {
        let mut classes = self.classes.lock();
        if let Some(c) = classes.get(name) {
            return Arc::clone(c);
        }
        let c = LockClass::new(&self.arena, name).expect("lock class row");
        classes.insert(name, Arc::clone(&c));
        c
    }

    /// Intern a TCP pool by key: first reference constructs, last drop
    /// destroys.
    pub fn pool_ref(&self, key: PoolKey) -> Arc<TcpPool> {
        let mut pools = self.pools.lock();
        if let Some(weak) = pools.get(&key) {
            if let Some(pool) = weak.upgrade() {
                return pool;
            }
        }
        let pool = TcpPool::new(
            key.clone(),
            Arc::clone(&self.waiter),
            self.stats.clone(),
            Arc::clone(&self.pool_class),
            self.params.backend_idle_timeout,
            self.params.max_pool_conns,
        );
        pools.retain(|_, w| w.strong_count() > 0);
        pools.insert(key, Arc::downgrade(&pool));
        pool
    }

    /// Create and register a backend (pool interned, probe started).
    pub fn new_backend(&self, def: BackendDef) -> Arc<Backend> {
        let pool = self.pool_ref(pool_key_for(&def));
        let backend = Backend::new(def.name.clone(), pool, vtim::real_now());
        let probe = def.probe.map(|pd| Probe::start(&backend, pd));
        self.backends.insert(Arc::clone(&backend), probe);
        backend
    }

    /// Build the management command registry for this runtime.
    pub fn cli_registry(self: &Arc<Self>) -> crate::cli::CliRegistry {
        use crate::cli::{CliRegistry, CliResponse, CliStatus};
        use std::fmt::Write;

        let mut reg = CliRegistry::new();
        reg.register("ping", 0, 0, 0, Box::new(|_| CliResponse::ok("PONG")));

        let rt = Arc::clone(self);
        reg.register(
            "backend.list",
            0,
            0,
            0,
            Box::new(move |_| {
                let mut out = String::from("Backend\tAdmin\tHealth\n");
                for name in rt.backends.names() {
                    let Some(be) = rt.backends.by_name(&name) else {
                        continue;
                    };
                    let _ = writeln!(
                        out,
                        "{}\t{:?}\t{}",
                        be.name,
                        be.admin_health(),
                        if be.is_healthy() { "healthy" } else { "sick" }
                    );
                }
                CliResponse::ok(out)
            }),
        );

        let rt = Arc::clone(self);
        reg.register(
            "backend.set_health",
            10,
            2,
            2,
            Box::new(move |args| {
                let state = match args[1] {
                    "healthy" => crate::backend::AdminHealth::Healthy,
                    "sick" => crate::backend::AdminHealth::Sick,
                    "auto" => crate::backend::AdminHealth::Auto,
                    other => {
                        return CliResponse::err(
                            CliStatus::Param,
                            format!("unknown state '{other}' (healthy|sick|auto)"),
                        );
                    }
                };
                match rt.backends.by_name(args[0]) {
                    Some(be) => {
                        be.set_admin_health(state, vtim::real_now());
                        CliResponse::ok(format!("{} -> {:?}", be.name, state))
                    }
                    None => CliResponse::err(
                        CliStatus::CantPerform,
                        format!("no backend named '{}'", args[0]),
                    ),
                }
            }),
        );

        let rt = Arc::clone(self);
        reg.register(
            "stats.show",
            0,
            0,
            0,
            Box::new(move |_| {
                use std::sync::atomic::Ordering::Relaxed;
                let s = &*rt.stats;
                let mut out = String::new();
                for (name, v) in [
                    ("shm_writes", s.shm_writes.load(Relaxed)),
                    ("shm_records", s.shm_records.load(Relaxed)),
                    ("shm_cont", s.shm_cont.load(Relaxed)),
                    ("shm_cycles", s.shm_cycles.load(Relaxed)),
                    ("vsl_trunc", s.vsl_trunc.load(Relaxed)),
                    ("n_object", s.n_object.load(Relaxed)),
                    ("n_expired", s.n_expired.load(Relaxed)),
                    ("n_lru_nuked", s.n_lru_nuked.load(Relaxed)),
                    ("n_backend", s.n_backend.load(Relaxed)),
                    ("n_pool", s.n_pool.load(Relaxed)),
                    ("pool_conn_opened", s.pool_conn_opened.load(Relaxed)),
                    ("pool_conn_reused", s.pool_conn_reused.load(Relaxed)),
                    ("pool_conn_stolen", s.pool_conn_stolen.load(Relaxed)),
                    ("pool_wait_timeout", s.pool_wait_timeout.load(Relaxed)),
                    ("ws_overflow", s.ws_overflow.load(Relaxed)),
                ] {
                    let _ = writeln!(out, "{name}\t{v}");
                }
                CliResponse::ok(out)
            }),
        );

        reg
    }

    /// Reserve the panic dump region and install the hook. Call once per
    /// process, from the runtime that should receive dumps.
    pub fn install_panic_hook(&self) -> CoreResult<()> {
        let region = PanicRegion::reserve(&self.arena)?;
        panicdump::install(region, &self.vsl);
        Ok(())
    }

    /// Orderly shutdown: probes, idle connections, waiter, expiry, then
    /// the arena generation.
    pub fn shutdown(&self) {
        self.backends.stop_probes();
        self.backends.drain_pools();
        let pools: Vec<Arc<TcpPool>> = self
            .pools
            .lock()
            .values()
            .filter_map(|w| w.upgrade())
            .collect();
        for p in pools {
            p.drain();
        }
        self.waiter.shutdown();
        self.expiry.shutdown();
        self.arena.abandon();
        tracing::info!("runtime down");
    }
}
