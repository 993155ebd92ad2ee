//! The director interface.
//!
//! A director resolves one backend per transaction. Directors compose:
//! `resolve` may hand back another director, and callers recurse with a
//! depth bound. Directors hold non-owning references to their children
//! conceptually; in this implementation children are `Arc`s whose
//! lifetime is anchored by the runtime's registries, so a director never
//! keeps a deleted backend alive beyond its cooling interval plus
//! in-flight use.

use crate::error::{DirResult, DirectorError};
use palisade_core::backend::Backend;
use palisade_core::ws::Ctx;
use std::sync::Arc;

/// What a resolution step produced.
pub enum Pick {
    /// A concrete backend.
    Backend(Arc<Backend>),
    /// Another director to resolve.
    Director(Arc<dyn Director>),
}

/// Maximum director-to-director indirections per resolution.
pub const MAX_RESOLVE_DEPTH: usize = 5;

/// A load-balancing policy object.
pub trait Director: Send + Sync {
    /// Instance name.
    fn name(&self) -> &str;

    /// Policy type tag ("round-robin", "shard", ...).
    fn type_name(&self) -> &'static str;

    /// Aggregate health and the latest health-change time.
    fn healthy(&self, ctx: &mut Ctx, now: f64) -> (bool, f64);

    /// Pick for the current transaction.
    fn resolve(&self, ctx: &mut Ctx) -> Option<Pick>;

    /// Append a human-readable child listing for introspection.
    fn list(&self, ctx: &mut Ctx, out: &mut String, weights: bool);
}

/// Resolve recursively down to a backend.
pub fn resolve_backend(
    dir: &Arc<dyn Director>,
    ctx: &mut Ctx,
) -> DirResult<Option<Arc<Backend>>> {
    let mut cur = Arc::clone(dir);
    for _ in 0..MAX_RESOLVE_DEPTH {
        match cur.resolve(ctx) {
            None => return Ok(None),
            Some(Pick::Backend(b)) => return Ok(Some(b)),
            Some(Pick::Director(d)) => cur = d,
        }
    }
    Err(DirectorError::ResolveDepth)
}

/// Adapter presenting a plain backend as a director.
pub struct BackendDirector {
    backend: Arc<Backend>,
}

impl BackendDirector {
    /// Wrap a backend.
    pub fn new(backend: Arc<Backend>) -> Arc<BackendDirector> {
        Arc::new(BackendDirector { backend })
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Director for BackendDirector {
    fn name(&self) -> &str {
        &self.backend.name
    }

    fn type_name(&self) -> &'static str {
        "backend"
    }

    fn healthy(&self, _ctx: &mut Ctx, _now: f64) -> (bool, f64) {
        (self.backend.is_healthy(), self.backend.health_changed())
    }

    fn resolve(&self, _ctx: &mut Ctx) -> Option<Pick> {
        Some(Pick::Backend(Arc::clone(&self.backend)))
    }

    fn list(&self, _ctx: &mut Ctx, out: &mut String, _weights: bool) {
        use std::fmt::Write;
        let _ = writeln!(
            out,
            "\t{}\t{}",
            self.backend.name,
            if self.backend.is_healthy() {
                "healthy"
            } else {
                "sick"
            }
        );
    }
}

/// Convenience: wrap a backend as `Arc<dyn Director>`.
pub fn backend_director(backend: Arc<Backend>) -> Arc<dyn Director> {
    BackendDirector::new(backend)
}
