//! Error types for the data-plane runtime.
//!
//! The data path prefers status values over unwinding: transient failures
//! come back as `Err` and the caller decides between retry, grace serving
//! and a synthetic error response. Panics are reserved for invariant
//! violations (a lock held twice, a heap index mismatch).

use thiserror::Error;

/// Errors produced by the data-plane runtime.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Could not open a backend connection.
    #[error("no backend connection: {reason}")]
    NoConnection {
        /// Why the connect failed.
        reason: String,
    },

    /// A worker timed out waiting for a pool slot.
    #[error("timed out waiting for a pooled connection")]
    PoolWaitTimeout,

    /// The cumulative send timeout was exceeded.
    #[error("send timeout exceeded")]
    SendTimeout,

    /// A read deadline passed.
    #[error("{which} timeout exceeded")]
    ReadTimeout {
        /// Which deadline fired (first-byte or between-bytes).
        which: &'static str,
    },

    /// An LRU walk found no unreferenced object to evict.
    #[error("cannot make space: all LRU candidates are referenced")]
    CannotMakeSpace,

    /// Per-request workspace exhausted.
    #[error("workspace overflow: need {need}, free {free}")]
    WsOverflow {
        /// Bytes requested.
        need: usize,
        /// Bytes remaining.
        free: usize,
    },

    /// Director resolution recursed past the depth bound.
    #[error("director resolution too deep")]
    ResolveDepth,

    /// The waiter rejected an entry.
    #[error("waiter error: {reason}")]
    Waiter {
        /// What went wrong arming the fd.
        reason: String,
    },

    /// Invalid runtime parameters.
    #[error("configuration error: {source}")]
    Config {
        /// Source validation error.
        #[from]
        source: palisade::params::ConfigError,
    },

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error.
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error.
        #[from]
        source: nix::Error,
    },

    /// Shared-memory arena error.
    #[error("arena error: {source}")]
    Shm {
        /// Source arena error.
        #[from]
        source: palisade_shm::ShmError,
    },
}

/// Result type for runtime operations.
pub type CoreResult<T> = Result<T, CoreError>;
