//! Shared director substrate.
//!
//! A rw-locked vector of weighted children plus a health snapshot
//! scratch. Add/remove take the lock exclusive; resolution helpers take
//! it shared, except the weighted pick which snapshots health under the
//! exclusive lock like its callers expect.

use crate::director::Director;
use palisade_core::sync::{LockClass, Rw};
use palisade_core::ws::Ctx;
use std::sync::Arc;

pub(crate) struct Child {
    pub dir: Arc<dyn Director>,
    pub weight: f64,
}

struct VdirInner {
    children: Vec<Child>,
    total_weight: f64,
    healthy: Vec<bool>,
}

/// The weighted child vector shared by the simple policies.
pub struct Vdir {
    rw: Rw<VdirInner>,
}

impl Vdir {
    /// Empty substrate.
    pub fn new(class: Arc<LockClass>) -> Vdir {
        Vdir {
            rw: Rw::new(class, VdirInner {
                children: Vec::new(),
                total_weight: 0.0,
                healthy: Vec::new(),
            }),
        }
    }

    /// Append a child.
    pub fn add(&self, dir: Arc<dyn Director>, weight: f64) {
        let mut inner = self.rw.write();
        inner.total_weight += weight;
        inner.children.push(Child { dir, weight });
        inner.healthy.push(false);
    }

    /// Remove the first child with this name; true when found.
    pub fn remove_named(&self, name: &str) -> bool {
        let mut inner = self.rw.write();
        let Some(pos) = inner.children.iter().position(|c| c.dir.name() == name) else {
            return false;
        };
        let c = inner.children.remove(pos);
        inner.total_weight -= c.weight;
        inner.healthy.pop();
        true
    }

    /// Child count.
    pub fn len(&self) -> usize {
        self.rw.read().children.len()
    }

    /// True when no children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the children (so callers can probe health without
    /// holding the lock across child calls).
    pub(crate) fn snapshot(&self) -> Vec<(Arc<dyn Director>, f64)> {
        self.rw
            .read()
            .children
            .iter()
            .map(|c| (Arc::clone(&c.dir), c.weight))
            .collect()
    }

    /// Aggregate health: true when any child is healthy; also the most
    /// recent health-change time across all children.
    pub fn any_healthy(&self, ctx: &mut Ctx, now: f64) -> (bool, f64) {
        let children = self.snapshot();
        let mut changed = 0.0f64;
        let mut retval = false;
        for (dir, _) in children {
            let (h, c) = dir.healthy(ctx, now);
            if c > changed {
                changed = c;
            }
            if h {
                retval = true;
                break;
            }
        }
        (retval, changed)
    }

    /// Weighted pick over healthy children only. `r` is uniform in
    /// [0, 1); returns `None` when no child is healthy.
    pub fn pick_weight(&self, ctx: &mut Ctx, now: f64, r: f64) -> Option<Arc<dyn Director>> {
        let children = self.snapshot();
        let mut healthy = Vec::with_capacity(children.len());
        let mut tw = 0.0;
        for (dir, weight) in &children {
            let h = dir.healthy(ctx, now).0;
            healthy.push(h);
            if h {
                tw += weight;
            }
        }
        {
            // Publish the snapshot for introspection.
            let mut inner = self.rw.write();
            if inner.healthy.len() == healthy.len() {
                inner.healthy.copy_from_slice(&healthy);
            }
        }
        if tw <= 0.0 {
            return None;
        }
        let want = r * tw;
        let mut acc = 0.0;
        for (i, (dir, weight)) in children.iter().enumerate() {
            if !healthy[i] {
                continue;
            }
            acc += weight;
            if want < acc {
                return Some(Arc::clone(dir));
            }
        }
        // r was exactly at the top of the range; last healthy child.
        children
            .iter()
            .enumerate()
            .rev()
            .find(|(i, _)| healthy[*i])
            .map(|(_, (dir, _))| Arc::clone(dir))
    }

    /// Append a child listing.
    pub fn list(&self, ctx: &mut Ctx, out: &mut String, weights: bool) {
        use std::fmt::Write;
        let children = self.snapshot();
        let total: f64 = children.iter().map(|(_, w)| w).sum();
        let _ = writeln!(out, "\tBackend\tWeight\tHealth");
        for (dir, weight) in children {
            let h = dir.healthy(ctx, 0.0).0;
            if weights && total > 0.0 {
                let _ = writeln!(
                    out,
                    "\t{}\t{:.2}%\t{}",
                    dir.name(),
                    100.0 * weight / total,
                    if h { "healthy" } else { "sick" }
                );
            } else {
                let _ = writeln!(
                    out,
                    "\t{}\t-\t{}",
                    dir.name(),
                    if h { "healthy" } else { "sick" }
                );
            }
        }
    }
}
