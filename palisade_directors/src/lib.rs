//! # Palisade Directors
//!
//! Pluggable load-balancing policies over the runtime's backends. A
//! director resolves one backend per transaction; directors compose and
//! callers recurse with a depth bound.
//!
//! Policies: round-robin, weighted random, fallback (optionally sticky),
//! and the consistent-hash shard director with staged per-task
//! reconfiguration and layered parameters.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod director;
pub mod error;
pub mod fallback;
pub mod random;
pub mod registry;
pub mod round_robin;
pub mod shard;
mod vdir;

pub use director::{
    BackendDirector, Director, MAX_RESOLVE_DEPTH, Pick, backend_director, resolve_backend,
};
pub use error::{DirResult, DirectorError};
pub use fallback::Fallback;
pub use random::Random;
pub use registry::DirectorRegistry;
pub use round_robin::RoundRobin;
pub use shard::{
    HashBy, HealthyPolicy, ShardBackend, ShardDebug, ShardDirector, ShardParam, ShardTaskParam,
};
pub use vdir::Vdir;
