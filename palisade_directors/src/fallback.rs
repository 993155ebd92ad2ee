//! Fallback director.
//!
//! Prefers earlier children; later ones serve only while everything
//! before them is sick. The sticky variant remembers the last child that
//! worked and advances only on failure. The sticky cursor is a bare
//! atomic with no serialisation: concurrent resolves may double-advance,
//! which is acceptable by design.

use crate::director::{Director, Pick};
use crate::vdir::Vdir;
use palisade_core::sync::LockClass;
use palisade_core::ws::Ctx;
use palisade::vtim;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ordered-preference director.
pub struct Fallback {
    name: String,
    vd: Vdir,
    sticky: bool,
    cur: AtomicUsize,
}

impl Fallback {
    /// Create an empty fallback director.
    pub fn new(name: &str, class: Arc<LockClass>, sticky: bool) -> Arc<Fallback> {
        Arc::new(Fallback {
            name: name.to_string(),
            vd: Vdir::new(class),
            sticky,
            cur: AtomicUsize::new(0),
        })
    }

    /// Append a child (order matters).
    pub fn add_backend(&self, dir: Arc<dyn Director>) {
        self.vd.add(dir, 1.0);
    }

    /// Remove a child by name.
    pub fn remove_backend(&self, name: &str) -> bool {
        let removed = self.vd.remove_named(name);
        if removed {
            self.cur.store(0, Ordering::Relaxed);
        }
        removed
    }
}

impl Director for Fallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "fallback"
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
        let mut cur = if self.sticky {
            self.cur.load(Ordering::Relaxed) % n
        } else {
            0
        };
        for _ in 0..n {
            if children[cur].0.healthy(ctx, now).0 {
                if self.sticky {
                    self.cur.store(cur, Ordering::Relaxed);
                }
                return Some(Pick::Director(Arc::clone(&children[cur].0)));
            }
            cur = (cur + 1) % n;
        }
        None
    }

    fn list(&self, ctx: &mut Ctx, out: &mut String, weights: bool) {
        self.vd.list(ctx, out, weights);
    }
}
