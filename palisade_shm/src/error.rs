//! Error types for arena and log operations

use thiserror::Error;

/// Errors that can occur in shared-memory arena operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Arena file not found
    #[error("arena not found: {path}")]
    NotFound {
        /// Path that was probed
        path: String,
    },

    /// A marker field did not match its expected value
    #[error("bad marker in {what}")]
    BadMarker {
        /// Which structure carried the bad marker
        what: String,
    },

    /// Requested or mapped size is out of range
    #[error("invalid size: {size} bytes")]
    BadSize {
        /// Offending size
        size: usize,
    },

    /// A class/type/ident string exceeds its fixed field
    #[error("ident too long: {ident}")]
    IdentTooLong {
        /// Offending string
        ident: String,
    },

    /// The writer abandoned the arena (allocator generation is zero)
    #[error("arena abandoned by writer")]
    Abandoned,

    /// Allocator generation kept changing while scanning - retry exhausted
    #[error("arena unstable - too many concurrent updates")]
    Unstable,

    /// Structural corruption detected while walking shared state
    #[error("arena corrupt: {detail}")]
    Corrupt {
        /// What was found
        detail: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization error for the discovery sidecar
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for shared-memory operations
pub type ShmResult<T> = Result<T, ShmError>;
