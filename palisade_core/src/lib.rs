//! # Palisade Data-Plane Runtime
//!
//! The machinery between client connections, cached objects and backend
//! connections: counted locks, a timer heap plus LRU expiry engine, an fd
//! waiter for idle keepalives, per-endpoint TCP connection pools with
//! steal-on-wait, backends with probes and a cooling list, a per-request
//! workspace/context, and the `Runtime` handle tying it all to one
//! shared-memory arena.
//!
//! ## Execution model
//!
//! Parallel OS threads throughout; blocking on a condvar or the event
//! facility is real OS blocking. There is no cooperative scheduler.
//! Dedicated threads: one expiry hang-man, one per waiter instance, one
//! per probe. Everything else runs on worker threads owned by the caller.
//!
//! ## Lock order
//!
//! `Lru.mtx` before the timer mutex. The hang-man, which meets them in
//! the other order, only ever trylocks the LRU and restarts on failure.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cli;
pub mod error;
pub mod expire;
pub mod heap;
pub mod net;
pub mod objcore;
pub mod panicdump;
pub mod pool;
pub mod probe;
pub mod runtime;
pub mod sync;
pub mod waiter;
pub mod ws;

pub use backend::{AdminHealth, Backend, BackendDef, BackendRegistry};
pub use cli::{CliRegistry, CliResponse, CliStatus};
pub use error::{CoreError, CoreResult};
pub use expire::{ExpiryEngine, SessExp};
pub use heap::{BinHeap, HeapItem, NOIDX};
pub use net::{Timeouts, recv_timed, send_iovecs};
pub use objcore::{Lru, ObjCore, OcFlags};
pub use pool::{ConnState, PoolKey, PooledConn, TcpPool};
pub use probe::{Probe, ProbeDef};
pub use runtime::Runtime;
pub use sync::{Cond, LockClass, Mtx, Rw};
pub use waiter::{WaitReason, WaitToken, Waited, Waiter, new_waiter};
pub use ws::{Ctx, Ws, WsSlice};
