//! Consistent-hash shard director.
//!
//! Requests map onto a sorted circle of hash points, `replicas * weight`
//! per backend, so a key consistently lands on the same backend and
//! membership changes only remap the affected slice of key space.
//! Reconfiguration is staged per task (see [`cfg`]) and the live ring
//! only ever changes under the exclusive lock in `reconfigure`.

pub mod cfg;
pub mod param;

pub use cfg::{RingPoint, ShardBackend, ShardChange};
pub use param::{HashBy, HealthyPolicy, ResolvedParam, ShardParam, ShardTaskParam};

use crate::director::{Director, Pick};
use crate::error::{DirResult, DirectorError};
use cfg::{ChangeBackend, ChangeTask};
use palisade_core::backend::Backend;
use palisade_core::sync::{LockClass, Rw};
use palisade_core::ws::Ctx;
use palisade_shm::VslTag;
use bitflags::bitflags;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

bitflags! {
    /// Debug trace gates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShardDebug: u32 {
        /// Trace lookups.
        const LOOKUP = 1;
        /// Trace circle construction.
        const CIRCLE = 1 << 1;
        /// Trace rampup/warmup decisions.
        const RAMPWARM = 1 << 2;
    }
}

struct ShardInner {
    backends: Vec<ShardBackend>,
    ring: Vec<RingPoint>,
    replicas: u32,
}

/// The shard director.
pub struct ShardDirector {
    name: String,
    inner: Rw<ShardInner>,
    /// Director-scope parameter overrides (the object layer).
    param: parking_lot::Mutex<ShardParam>,
    rampup_duration: AtomicU64,
    debug: AtomicU32,
}

#[inline]
fn f2b(v: f64) -> u64 {
    v.to_bits()
}

#[inline]
fn b2f(b: u64) -> f64 {
    f64::from_bits(b)
}

impl ShardDirector {
    /// Create an empty shard director. `rampup_duration` is the default
    /// fade-in for backends without a per-slot override.
    pub fn new(name: &str, class: Arc<LockClass>, rampup_duration: f64) -> Arc<ShardDirector> {
        Arc::new(ShardDirector {
            name: name.to_string(),
            inner: Rw::new(class, ShardInner {
                backends: Vec::new(),
                ring: Vec::new(),
                replicas: 0,
            }),
            param: parking_lot::Mutex::new(ShardParam::default()),
            rampup_duration: AtomicU64::new(f2b(rampup_duration)),
            debug: AtomicU32::new(0),
        })
    }

    /// Identity of this instance, used to bind task-scope state.
    fn id(&self) -> usize {
        self as *const ShardDirector as usize
    }

    /// Enable debug traces.
    pub fn set_debug(&self, flags: ShardDebug) {
        self.debug.store(flags.bits(), Ordering::Relaxed);
    }

    fn dbg(&self, flag: ShardDebug) -> bool {
        ShardDebug::from_bits_truncate(self.debug.load(Ordering::Relaxed)).contains(flag)
    }

    /// Change the default rampup duration.
    pub fn set_rampup(&self, duration: f64) {
        assert!(duration >= 0.0);
        self.rampup_duration.store(f2b(duration), Ordering::Relaxed);
    }

    /// Set the object-layer warmup bias.
    pub fn set_warmup(&self, probability: f64) -> DirResult<()> {
        let p = ShardParam {
            warmup: Some(probability),
            ..Default::default()
        };
        p.validate()?;
        self.param.lock().warmup = Some(probability);
        Ok(())
    }

    /// Replace the object-layer parameter set.
    pub fn set_param(&self, param: ShardParam) -> DirResult<()> {
        param.validate()?;
        *self.param.lock() = param;
        Ok(())
    }

    /// Set the task-scope parameter override for this director.
    pub fn set_task_param(&self, ctx: &mut Ctx, param: ShardParam) -> DirResult<()> {
        param.validate()?;
        let id = self.id();
        let slot = ctx.task_get_or(|| ShardTaskParam {
            dir_id: id,
            param: ShardParam::default(),
        });
        if slot.dir_id != id {
            return Err(DirectorError::ChangeConflict {
                name: self.name.clone(),
            });
        }
        slot.param = param;
        Ok(())
    }

    fn change_mut<'a>(&self, ctx: &'a mut Ctx) -> DirResult<&'a mut ShardChange> {
        let id = self.id();
        let change = ctx.task_get_or(|| ShardChange::new(id, &self.name));
        if change.dir_id != id {
            return Err(DirectorError::ChangeConflict {
                name: change.dir_name.clone(),
            });
        }
        Ok(change)
    }

    /// Stage an add. Nothing changes until `reconfigure`.
    pub fn add_backend(
        &self,
        ctx: &mut Ctx,
        backend: Arc<Backend>,
        ident: Option<&str>,
        rampup: Option<f64>,
        weight: u32,
    ) -> DirResult<()> {
        let change = self.change_mut(ctx)?;
        change.tasks.push(ChangeTask::Add(ChangeBackend {
            backend: Some(backend),
            ident: ident.filter(|i| !i.is_empty()).map(str::to_string),
            rampup,
            weight: weight.max(1),
        }));
        Ok(())
    }

    /// Stage a remove: by ident when given, else every slot of the
    /// backend.
    pub fn remove_backend(
        &self,
        ctx: &mut Ctx,
        backend: Option<Arc<Backend>>,
        ident: Option<&str>,
    ) -> DirResult<()> {
        let change = self.change_mut(ctx)?;
        change.tasks.push(ChangeTask::Remove(ChangeBackend {
            backend,
            ident: ident.filter(|i| !i.is_empty()).map(str::to_string),
            rampup: None,
            weight: 1,
        }));
        Ok(())
    }

    /// Stage a clear.
    pub fn clear(&self, ctx: &mut Ctx) -> DirResult<()> {
        let change = self.change_mut(ctx)?;
        change.tasks.push(ChangeTask::Clear);
        Ok(())
    }

    /// Merge the task's change list and rebuild the ring with `replicas`
    /// points per weight unit.
    pub fn reconfigure(&self, ctx: &mut Ctx, replicas: i64) -> DirResult<()> {
        if replicas <= 0 {
            return Err(DirectorError::InvalidReplicas { replicas });
        }
        // Taking the list consumes it: the task starts clean afterwards.
        let Some(change) = ctx.task_take::<ShardChange>() else {
            return Ok(());
        };
        if change.dir_id != self.id() {
            let name = change.dir_name.clone();
            // Not ours: put it back untouched.
            ctx.task_get_or(|| change);
            return Err(DirectorError::ChangeConflict { name });
        }
        if change.tasks.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let outcome = cfg::apply_change(&inner.backends, &change);
        for notice in &outcome.notices {
            ctx.vsl
                .log(VslTag::Notice, format!("shard {}: (notice) {}", self.name, notice).as_bytes());
            tracing::warn!(shard = %self.name, "{notice}");
        }
        let mut backends = outcome.backends;
        if backends.is_empty() {
            inner.backends.clear();
            inner.ring.clear();
            inner.replicas = replicas as u32;
            return Err(DirectorError::NoBackends {
                name: self.name.clone(),
            });
        }
        let ring = cfg::build_ring(&mut backends, replicas as u32)?;
        if self.dbg(ShardDebug::CIRCLE) {
            for (i, p) in ring.iter().enumerate() {
                tracing::debug!(
                    shard = %self.name,
                    "hashcircle[{i}] = {{point = {:8x}, host = {}}}",
                    p.point,
                    p.host
                );
            }
        }
        inner.backends = backends;
        inner.ring = ring;
        inner.replicas = replicas as u32;
        Ok(())
    }

    /// Live backend count.
    pub fn n_backend(&self) -> usize {
        self.inner.read().backends.len()
    }

    /// Ring size in points.
    pub fn n_points(&self) -> usize {
        self.inner.read().ring.len()
    }

    /// Snapshot of the slots, for introspection and tests.
    pub fn backends(&self) -> Vec<ShardBackend> {
        self.inner.read().backends.clone()
    }

    /// Resolve with explicit call-site arguments (the outermost layer).
    pub fn backend(&self, ctx: &mut Ctx, args: &ShardParam) -> DirResult<Option<Arc<Backend>>> {
        args.validate()?;
        let merged = self.merged_param(ctx, Some(args));
        let key = param::derive_key(ctx, &merged);
        Ok(self.pick(ctx, key, &merged))
    }

    fn merged_param(&self, ctx: &Ctx, args: Option<&ShardParam>) -> ResolvedParam {
        let mut resolved = self.param.lock().merge_over(&param::static_defaults());
        if let Some(task) = ctx.task_get::<ShardTaskParam>() {
            if task.dir_id == self.id() {
                resolved = task.param.merge_over(&resolved);
            }
        }
        if let Some(a) = args {
            resolved = a.merge_over(&resolved);
        }
        resolved
    }

    /// The pick: lower-bound search, then a walk across distinct hosts.
    fn pick(&self, ctx: &mut Ctx, key: u32, p: &ResolvedParam) -> Option<Arc<Backend>> {
        let now = ctx.now;
        let inner = self.inner.read();
        let ring = &inner.ring;
        if ring.is_empty() {
            return None;
        }
        let n_hosts = inner.backends.len();
        let default_rampup = b2f(self.rampup_duration.load(Ordering::Relaxed));
        let mut rng = rand::thread_rng();

        // Smallest point >= key, wrapping to the start.
        let first = ring.partition_point(|rp| rp.point < key);
        let start = if first == ring.len() { 0 } else { first };

        if self.dbg(ShardDebug::LOOKUP) {
            tracing::debug!(
                shard = %self.name,
                key = format_args!("{key:x}"),
                start,
                "lookup"
            );
        }

        let mut seen = vec![false; n_hosts];
        let mut distinct: u32 = 0;
        for step in 0..ring.len() {
            let rp = ring[(start + step) % ring.len()];
            let host = rp.host as usize;
            if seen[host] {
                continue;
            }
            seen[host] = true;
            let pos = distinct;
            distinct += 1;
            if pos < p.alt {
                continue;
            }

            let slot = &inner.backends[host];
            if p.healthy != HealthyPolicy::Ignore && !slot.backend.is_healthy() {
                continue;
            }

            if p.rampup {
                let dur = slot.rampup.unwrap_or(default_rampup);
                if dur > 0.0 {
                    let elapsed = now - slot.backend.became_healthy();
                    if elapsed < dur {
                        let prob = (elapsed / dur) * (elapsed / dur);
                        if rng.gen_range(0.0..1.0) >= prob {
                            if self.dbg(ShardDebug::RAMPWARM) {
                                tracing::debug!(
                                    shard = %self.name,
                                    backend = %slot.backend.name,
                                    elapsed,
                                    "rampup deferred"
                                );
                            }
                            continue;
                        }
                    }
                }
            }

            // Warmup: at the primary candidate, defer to the secondary
            // with probability `warmup`.
            if pos == p.alt && p.warmup > 0.0 && p.warmup < 1.0 {
                if rng.gen_range(0.0..1.0) < p.warmup {
                    if self.dbg(ShardDebug::RAMPWARM) {
                        tracing::debug!(
                            shard = %self.name,
                            backend = %slot.backend.name,
                            "warmup deferred to secondary"
                        );
                    }
                    continue;
                }
            }

            return Some(Arc::clone(&slot.backend));
        }
        None
    }
}

impl Director for ShardDirector {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "shard"
    }

    fn healthy(&self, _ctx: &mut Ctx, _now: f64) -> (bool, f64) {
        let inner = self.inner.read();
        let mut changed = 0.0f64;
        let mut any = false;
        for b in &inner.backends {
            let c = b.backend.health_changed();
            if c > changed {
                changed = c;
            }
            if b.backend.is_healthy() {
                any = true;
            }
        }
        (any, changed)
    }

    fn resolve(&self, ctx: &mut Ctx) -> Option<Pick> {
        let merged = self.merged_param(ctx, None);
        let key = param::derive_key(ctx, &merged);
        self.pick(ctx, key, &merged).map(Pick::Backend)
    }

    fn list(&self, _ctx: &mut Ctx, out: &mut String, weights: bool) {
        use std::fmt::Write;
        let inner = self.inner.read();
        let _ = writeln!(out, "\tBackend\tIdent\tWeight\tHealth");
        for b in &inner.backends {
            let _ = writeln!(
                out,
                "\t{}\t{}\t{}\t{}",
                b.backend.name,
                b.ident.as_deref().unwrap_or("-"),
                if weights { b.weight } else { 1 },
                if b.backend.is_healthy() {
                    "healthy"
                } else {
                    "sick"
                }
            );
        }
        let _ = writeln!(out, "\t{} points, {} replicas", inner.ring.len(), inner.replicas);
    }
}
