//! Staged shard reconfiguration.
//!
//! `add`, `remove` and `clear` never touch the live ring. They append to
//! a change list scoped to the request's task state, bound to one
//! director per task. `reconfigure` merges the list under the exclusive
//! lock: a clear restarts from empty, duplicate adds are skipped with a
//! notice, removals punch holes, holes are compacted by swapping the
//! last live entry in, and the ring is rebuilt with the new replica
//! count. Task state that is never reconfigured dies with the request.

use super::param::sha256_point;
use crate::error::{DirResult, DirectorError};
use palisade_core::backend::Backend;
use std::sync::Arc;

/// One backend slot of a shard director.
#[derive(Clone)]
pub struct ShardBackend {
    /// The backend.
    pub backend: Arc<Backend>,
    /// Optional ident distinguishing multiple slots of one backend.
    pub ident: Option<String>,
    /// Per-slot rampup override, seconds.
    pub rampup: Option<f64>,
    /// Integer weight; points on the ring are `replicas * weight`.
    pub weight: u32,
    /// First ring point of this slot, for introspection.
    pub canon_point: u32,
}

impl ShardBackend {
    /// The identity string used for ring points and duplicate checks.
    pub fn eff_ident(&self) -> &str {
        self.ident.as_deref().unwrap_or(&self.backend.name)
    }
}

/// A backend spec inside a change task.
pub(crate) struct ChangeBackend {
    pub backend: Option<Arc<Backend>>,
    pub ident: Option<String>,
    pub rampup: Option<f64>,
    pub weight: u32,
}

impl ChangeBackend {
    fn eff_ident(&self) -> Option<&str> {
        match (&self.ident, &self.backend) {
            (Some(i), _) => Some(i),
            (None, Some(b)) => Some(&b.name),
            (None, None) => None,
        }
    }

    /// Duplicate check against a live slot: with no idents anywhere the
    /// backend identity decides, otherwise the effective ident strings.
    fn same_slot(&self, slot: &ShardBackend) -> bool {
        if self.ident.is_none() && slot.ident.is_none() {
            if let Some(b) = &self.backend {
                return Arc::ptr_eq(b, &slot.backend);
            }
        }
        match self.eff_ident() {
            Some(i) => i == slot.eff_ident(),
            None => false,
        }
    }

    /// Removal match: an explicit ident removes by ident, a bare backend
    /// removes every slot of that backend.
    fn removes(&self, slot: &ShardBackend) -> bool {
        match &self.ident {
            None => match &self.backend {
                Some(b) => Arc::ptr_eq(b, &slot.backend),
                None => false,
            },
            Some(_) => self.same_slot(slot),
        }
    }
}

pub(crate) enum ChangeTask {
    Clear,
    Add(ChangeBackend),
    Remove(ChangeBackend),
}

/// Per-task change list, stored in `Ctx::priv_task`. Only one shard
/// director may be reconfigured per task.
pub struct ShardChange {
    pub(crate) dir_id: usize,
    pub(crate) dir_name: String,
    pub(crate) tasks: Vec<ChangeTask>,
}

impl ShardChange {
    pub(crate) fn new(dir_id: usize, dir_name: &str) -> ShardChange {
        ShardChange {
            dir_id,
            dir_name: dir_name.to_string(),
            tasks: Vec::new(),
        }
    }
}

/// Outcome of merging a change list into a backend vector.
pub(crate) struct ApplyOutcome {
    pub backends: Vec<ShardBackend>,
    /// Duplicate adds skipped, reported as notices by the caller.
    pub notices: Vec<String>,
}

/// Merge the change list over the current slots.
pub(crate) fn apply_change(current: &[ShardBackend], change: &ShardChange) -> ApplyOutcome {
    let mut notices = Vec::new();

    // A clear restarts the merge from empty at the last clear task.
    let start = change
        .tasks
        .iter()
        .rposition(|t| matches!(t, ChangeTask::Clear))
        .map(|i| i + 1);
    let mut slots: Vec<Option<ShardBackend>> = match start {
        Some(_) => Vec::new(),
        None => current.iter().cloned().map(Some).collect(),
    };
    let tasks = &change.tasks[start.unwrap_or(0)..];

    for task in tasks {
        match task {
            ChangeTask::Clear => unreachable!("clears before the last were skipped"),
            ChangeTask::Add(spec) => {
                let backend = spec
                    .backend
                    .as_ref()
                    .expect("add tasks always carry a backend");
                if let Some(existing) = slots
                    .iter()
                    .flatten()
                    .find(|s| spec.same_slot(s))
                {
                    notices.push(format!(
                        "backend {}{}{} already exists - skipping",
                        existing.backend.name,
                        if existing.ident.is_some() { "/" } else { "" },
                        existing.ident.as_deref().unwrap_or("")
                    ));
                    continue;
                }
                let slot = ShardBackend {
                    backend: Arc::clone(backend),
                    ident: spec.ident.clone(),
                    rampup: spec.rampup,
                    weight: spec.weight.max(1),
                    canon_point: 0,
                };
                // Fill the first hole, else append.
                match slots.iter_mut().find(|s| s.is_none()) {
                    Some(hole) => *hole = Some(slot),
                    None => slots.push(Some(slot)),
                }
            }
            ChangeTask::Remove(spec) => {
                for s in slots.iter_mut() {
                    if s.as_ref().is_some_and(|slot| spec.removes(slot)) {
                        *s = None;
                    }
                }
            }
        }
    }

    // Compact: swap the last live entry into each hole.
    let mut i = 0;
    while i < slots.len() {
        if slots[i].is_some() {
            i += 1;
            continue;
        }
        while slots.last().is_some_and(|s| s.is_none()) {
            slots.pop();
        }
        if i < slots.len() {
            let last = slots.pop().expect("non-empty after trim");
            slots[i] = last;
            i += 1;
        }
    }

    ApplyOutcome {
        backends: slots.into_iter().flatten().collect(),
        notices,
    }
}

/// One entry of the hash circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPoint {
    /// 32-bit position on the circle.
    pub point: u32,
    /// Index into the backend vector.
    pub host: u32,
}

/// Build the circle: `replicas * weight` points per slot, each point the
/// first four bytes of `sha256(ident, decimal(i))`, stably sorted.
pub(crate) fn build_ring(
    backends: &mut [ShardBackend],
    replicas: u32,
) -> DirResult<Vec<RingPoint>> {
    let total: u64 = backends
        .iter()
        .map(|b| replicas as u64 * b.weight as u64)
        .sum();
    if total > u32::MAX as u64 {
        return Err(DirectorError::InvalidReplicas {
            replicas: replicas as i64,
        });
    }
    let mut ring = Vec::with_capacity(total as usize);
    for (host, b) in backends.iter_mut().enumerate() {
        let ident = b.ident.as_deref().unwrap_or(&b.backend.name);
        let points = replicas * b.weight;
        for i in 0..points {
            let point = sha256_point(&[ident.as_bytes(), i.to_string().as_bytes()]);
            if i == 0 {
                b.canon_point = point;
            }
            ring.push(RingPoint {
                point,
                host: host as u32,
            });
        }
    }
    ring.sort_by_key(|p| p.point);
    Ok(ring)
}
