//! Palisade Common Library
//!
//! Shared constants, the runtime `Params` struct and clock helpers used by
//! every palisade workspace crate.
//!
//! # Module Structure
//!
//! - [`consts`] - Shared-memory markers and layout constants
//! - [`params`] - Runtime tunables with TOML loading and validation
//! - [`vtim`] - Wall-clock and monotonic time as `f64` seconds
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! palisade = { package = "palisade_common", path = "../palisade_common" }
//! ```

pub mod consts;
pub mod params;
pub mod vtim;

pub use params::{ConfigError, Params, WaiterKind};
