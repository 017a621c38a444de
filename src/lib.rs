//! # coshm
//!
//! A handle-based allocator for shared memory visible to a non-coherent
//! coprocessor, with explicit host cache management.
//!
//! The host CPU caches this memory; the coprocessor does not snoop those
//! caches, so every access window is bracketed: lock invalidates before the
//! host reads, unlock flushes after the host writes. The kernel exposes two
//! mutually incompatible transports for the same memory (see
//! [`backend::Backend`]); the channel binds to one at open and every
//! operation dispatches through it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use coshm::{CacheMode, Shm};
//!
//! let shm = Shm::open(false, None)?;
//! let handle = shm.allocate(64 * 1024, CacheMode::Host, "scratch")?;
//!
//! {
//!     let guard = shm.lock(handle)?;
//!     // read/write through guard.as_ptr()
//! } // dropping the guard flushes and ends the window
//!
//! shm.free(handle);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod backend;
pub mod cache;
pub mod error;
pub mod request;
pub mod shm;
pub mod transport;

/// A channel-scoped allocation identifier. Zero is never a valid live
/// handle; lookups use it as "no handle".
pub type Handle = u32;

pub use arena::ARENA_CAPACITY;
pub use backend::Backend;
pub use cache::CacheMode;
pub use error::{Error, Result};
pub use request::{CacheOp, ControlTransport, MaintOp};
pub use shm::{close, AccessGuard, Shm};
