//! Round-robin director.

use crate::director::{Director, Pick};
use crate::vdir::Vdir;
use palisade_core::sync::LockClass;
use palisade_core::ws::Ctx;
use palisade::vtim;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates over healthy children.
pub struct RoundRobin {
    name: String,
    vd: Vdir,
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Create an empty round-robin director.
    pub fn new(name: &str, class: Arc<LockClass>) -> Arc<RoundRobin> {
        Arc::new(RoundRobin {
            name: name.to_string(),
            vd: Vdir::new(class),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Append a child.
    pub fn add_backend(&self, dir: Arc<dyn Director>) {
        self.vd.add(dir, 1.0);
    }

    /// Remove a child by name.
    pub fn remove_backend(&self, name: &str) -> bool {
        self.vd.remove_named(name)
    }
}

impl Director for RoundRobin {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "round-robin"
    }

    fn healthy(&self, ctx: &mut Ctx, now: f64) -> (bool, f64) {
        self.vd.any_healthy(ctx, now)
    }

    fn resolve(&self, ctx: &mut Ctx) -> Option<Pick> {
        let children = self.vd.snapshot();
        let n = children.len();
        if n == 0 {
            return None;
        }
        let now = vtim::real_now();
        let start = self.cursor.load(Ordering::Relaxed) % n;
        for u in 0..n {
            let i = (start + u) % n;
            if children[i].0.healthy(ctx, now).0 {
                self.cursor.store((i + 1) % n, Ordering::Relaxed);
                return Some(Pick::Director(Arc::clone(&children[i].0)));
            }
        }
        self.cursor.store(start, Ordering::Relaxed);
        None
    }

    fn list(&self, ctx: &mut Ctx, out: &mut String, weights: bool) {
        self.vd.list(ctx, out, weights);
    }
}
