//! Weighted-random director.

use crate::director::{Director, Pick};
use crate::vdir::Vdir;
use palisade_core::sync::LockClass;
use palisade_core::ws::Ctx;
use palisade::vtim;
use rand::Rng;
use std::sync::Arc;

/// Draws uniformly over the healthy weight sum.
pub struct Random {
    name: String,
    vd: Vdir,
}

impl Random {
    /// Create an empty random director.
    pub fn new(name: &str, class: Arc<LockClass>) -> Arc<Random> {
        Arc::new(Random {
            name: name.to_string(),
            vd: Vdir::new(class),
        })
    }

    /// Append a weighted child.
    pub fn add_backend(&self, dir: Arc<dyn Director>, weight: f64) {
        self.vd.add(dir, weight.max(0.0));
    }

    /// Remove a child by name.
    pub fn remove_backend(&self, name: &str) -> bool {
        self.vd.remove_named(name)
    }
}

impl Director for Random {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "random"
    }

    fn healthy(&self, ctx: &mut Ctx, now: f64) -> (bool, f64) {
        self.vd.any_healthy(ctx, now)
    }

    fn resolve(&self, ctx: &mut Ctx) -> Option<Pick> {
        let r: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.vd
            .pick_weight(ctx, vtim::real_now(), r)
            .map(Pick::Director)
    }

    fn list(&self, ctx: &mut Ctx, out: &mut String, weights: bool) {
        self.vd.list(ctx, out, weights);
    }
}
