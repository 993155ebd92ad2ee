//! # Palisade Shared-Memory Observability
//!
//! A file-backed, lock-light shared-memory arena exposing live process
//! state to out-of-process tools: an allocator of tagged chunks, counter
//! rows readable with plain loads, and a segmented ring log with a
//! single-writer / many-reader publication protocol.
//!
//! ## Design
//!
//! - **No reader interlocks**: readers map the file read-only and validate
//!   consistency via the allocator generation, record end markers and the
//!   ring segment counter. The writer never waits for a reader.
//! - **Single writer**: exactly one process owns the arena writable. Many
//!   threads of that process may log concurrently through per-worker
//!   buffers that batch into the ring.
//! - **Degraded over broken**: when the arena fills up, allocations fall
//!   back to the process heap and only external visibility is lost; when a
//!   reader is lapped it resynchronizes and reports the gap.
//!
//! ## Thread Safety
//!
//! - [`Arena`], [`Vsl`], and [`StatRef`] handles are `Send + Sync`.
//! - [`VslBuffer`] is per-worker, not shared.
//! - [`VsmReader`] and [`VslCursor`] live in the reading process.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod error;
pub mod log;
pub mod platform;
pub mod reader;
pub mod record;
pub mod stats;

pub use arena::{Alloc, Arena, ArenaMeta};
pub use error::{ShmError, ShmResult};
pub use log::{TailRec, Vsl, VslBuffer};
pub use reader::{ChunkInfo, CursorStep, VslCursor, VsmReader};
pub use record::{OwnedRecord, VslTag};
pub use stats::{LockStats, MainStats, StatRef, WaiterStats};
