//! Backend selection and the operation trait.
//!
//! The kernel exposes two mutually incompatible transports for the same
//! coprocessor memory. The choice is made once, at channel open, and never
//! renegotiated; everything above dispatches through [`BackendOps`] instead
//! of branching per call.
//!
//! Operation availability differs by backend and is part of the contract:
//! `share`, `resize` and mode-changing `lock_cache` exist only on Legacy,
//! `export_external` only on Extended.

mod extended;
mod legacy;

pub use extended::ExtendedBackend;
pub use legacy::LegacyBackend;

use std::os::unix::io::OwnedFd;

use crate::cache::CacheMode;
use crate::error::Result;
use crate::request::CacheOp;
use crate::Handle;

/// Which kernel transport the control channel is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// The original transport: the kernel retains all allocation state and
    /// is queried by handle on every call.
    Legacy,
    /// The descriptor-based transport: each allocation has its own fd,
    /// user space keeps the bookkeeping in the arena.
    Extended,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Legacy => write!(f, "legacy"),
            Backend::Extended => write!(f, "extended"),
        }
    }
}

/// The operations both backends implement, with per-backend gaps surfacing
/// as [`crate::Error::UnsupportedOnBackend`].
///
/// Acquire-style operations propagate failure; `free` and `unlock` are
/// best-effort (failures logged, the driver reclaims at channel close).
pub trait BackendOps: Send + Sync + std::fmt::Debug {
    /// The backend tag.
    fn backend(&self) -> Backend;

    /// Allocate `size` bytes (already page-rounded) with an initial cache
    /// mode; the buffer is mapped before the handle is returned.
    fn allocate(&self, size: usize, mode: CacheMode, name: &str) -> Result<Handle>;

    /// Release an allocation: unmap, then release the backend resource.
    /// Always runs to completion; secondary failures are logged.
    fn free(&self, handle: Handle);

    /// Produce a second handle referencing the same memory (Legacy only).
    fn share(&self, handle: Handle) -> Result<Handle>;

    /// Grow or shrink an allocation (Legacy only). All-or-nothing from the
    /// caller's perspective unless the remap after a successful kernel
    /// resize fails, in which case the buffer is resized but unmapped and
    /// the error says so.
    fn resize(&self, handle: Handle, new_size: usize) -> Result<()>;

    /// Register and map memory allocated outside this library.
    fn import_external(&self, fd: OwnedFd, name: &str) -> Result<Handle>;

    /// Duplicate the allocation's descriptor for a consumer that will
    /// outlive the handle (Extended only).
    fn export_external(&self, handle: Handle) -> Result<OwnedFd>;

    /// Begin an access window: invalidate-before-read, then return the
    /// process-local pointer.
    fn lock(&self, handle: Handle) -> Result<*mut u8>;

    /// Begin an access window, moving the buffer's cache mode per the
    /// transition table. Returns the pointer and the resulting mode.
    fn lock_cache(&self, handle: Handle, requested: CacheMode) -> Result<(*mut u8, CacheMode)>;

    /// End an access window: flush-after-write unless `skip_flush`.
    /// Best-effort.
    fn unlock(&self, handle: Handle, skip_flush: bool);

    /// The process-local pointer for a live handle.
    fn address_of(&self, handle: Handle) -> Option<*mut u8>;

    /// The handle owning a process-local address.
    fn handle_of(&self, address: usize) -> Option<Handle>;

    /// The coprocessor-side identifier for a handle. Never usable for host
    /// mapping.
    fn coprocessor_handle_of(&self, handle: Handle) -> Result<u32>;

    /// The coprocessor bus address for a handle; absent when it does not
    /// fit the coprocessor's 32-bit space.
    fn coprocessor_bus_address_of(&self, handle: Handle) -> Result<Option<u32>>;

    /// Apply a batch of cache-maintenance operations in one request.
    fn clean_invalid(&self, ops: &[CacheOp]) -> Result<()>;

    /// Slots currently in use in the local arena; `None` on the backend
    /// that keeps no local bookkeeping.
    fn arena_occupancy(&self) -> Option<usize>;
}
