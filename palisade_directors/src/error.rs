//! Director error types

use thiserror::Error;

/// Errors from director configuration and resolution.
#[derive(Error, Debug)]
pub enum DirectorError {
    /// Resolution recursed past the depth bound.
    #[error("director resolution too deep")]
    ResolveDepth,

    /// A reconfiguration left the director without backends.
    #[error("shard {name}: no backends")]
    NoBackends {
        /// Director name.
        name: String,
    },

    /// A task tried to reconfigure a second director.
    #[error("cannot change more than one shard director at a time ({name})")]
    ChangeConflict {
        /// Director that already owns the task's change list.
        name: String,
    },

    /// Invalid replica count.
    #[error("invalid replicas argument {replicas}")]
    InvalidReplicas {
        /// Offending value.
        replicas: i64,
    },

    /// Invalid parameter value.
    #[error("invalid shard parameter: {what}")]
    InvalidParam {
        /// What was wrong.
        what: String,
    },

    /// A director with this name is already registered.
    #[error("director name already taken: {name}")]
    NameTaken {
        /// The conflicting name.
        name: String,
    },
}

/// Result type for director operations.
pub type DirResult<T> = Result<T, DirectorError>;
