//! Control-channel request vocabulary and the transport seam.
//!
//! Every operation the library performs against the kernel driver is
//! expressed as one variant of [`ControlRequest`], and every successful
//! answer as one variant of [`ControlResponse`]. The [`ControlTransport`]
//! trait is the single seam between operation semantics (backends) and the
//! ioctl wire: the real implementation lowers each variant to a `#[repr(C)]`
//! request struct, the mock implements the same vocabulary over memfds.

use std::os::unix::io::{BorrowedFd, OwnedFd};

use crate::cache::CacheMode;
use crate::error::{Error, Result};
use crate::Handle;

/// Which maintenance operation a bulk cache op performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaintOp {
    /// Write dirty host cache lines back to memory.
    Clean,
    /// Discard host cache lines so the next read hits memory.
    Invalidate,
    /// Clean, then invalidate.
    CleanInvalidate,
}

impl MaintOp {
    /// Wire representation for control requests.
    #[inline]
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            MaintOp::Clean => 1,
            MaintOp::Invalidate => 2,
            MaintOp::CleanInvalidate => 3,
        }
    }
}

/// One sub-range in a bulk cache-maintenance batch.
#[derive(Clone, Copy, Debug)]
pub struct CacheOp {
    /// The maintenance operation to apply.
    pub op: MaintOp,
    /// Start of the range (process-local address).
    pub address: usize,
    /// Length of the range in bytes.
    pub size: usize,
}

/// A request to the kernel control channel.
///
/// The vocabulary is backend-specific: the Legacy backend speaks the
/// handle-keyed variants (the kernel retains all allocation state), the
/// Extended backend speaks the descriptor variants (state lives in the
/// user-space arena, cache maintenance runs on the allocation's own fd).
#[derive(Debug)]
pub enum ControlRequest<'a> {
    /// Allocate `size` bytes with an initial cache mode.
    Allocate {
        /// Requested size, already page-rounded.
        size: usize,
        /// Initial cache mode.
        mode: CacheMode,
        /// Short debug name recorded with the allocation.
        name: &'a str,
    },
    /// Release an allocation (Legacy).
    Free {
        /// The kernel handle.
        handle: Handle,
    },
    /// Grow or shrink an allocation in place (Legacy).
    Resize {
        /// The kernel handle.
        handle: Handle,
        /// New size, already page-rounded.
        new_size: usize,
    },
    /// Produce a second handle referencing the same memory (Legacy).
    Share {
        /// The handle being shared.
        handle: Handle,
    },
    /// Begin an access window (Legacy).
    Lock {
        /// The kernel handle.
        handle: Handle,
    },
    /// Begin an access window and switch the cache mode (Legacy).
    LockWithCacheMode {
        /// The kernel handle.
        handle: Handle,
        /// The resulting mode, as computed by the transition table.
        mode: CacheMode,
    },
    /// End an access window (Legacy).
    Unlock {
        /// The kernel handle.
        handle: Handle,
    },
    /// Flush (clean) a mapped range from the host cache (Legacy).
    Flush {
        /// Start of the mapped range.
        address: usize,
        /// Length of the range.
        size: usize,
    },
    /// Invalidate a mapped range in the host cache (Legacy).
    Invalidate {
        /// Start of the mapped range.
        address: usize,
        /// Length of the range.
        size: usize,
    },
    /// Register memory the caller did not allocate through this library.
    Import {
        /// The external descriptor. The kernel takes its own reference.
        fd: BorrowedFd<'a>,
        /// Initial cache mode for the imported memory.
        mode: CacheMode,
        /// Short debug name.
        name: &'a str,
    },
    /// Query an allocation's byte size (Legacy).
    QuerySize {
        /// The kernel handle.
        handle: Handle,
    },
    /// Query an allocation's current cache mode (Legacy).
    QueryCacheState {
        /// The kernel handle.
        handle: Handle,
    },
    /// Query the mmap offset cookie for a handle on the channel descriptor
    /// (Legacy). Shared handles alias the same cookie.
    QueryMapOffset {
        /// The kernel handle.
        handle: Handle,
    },
    /// Query the coprocessor-side identifier for a handle (Legacy).
    QueryCoprocessorHandle {
        /// The kernel handle.
        handle: Handle,
    },
    /// Query the coprocessor bus address for a handle (Legacy).
    QueryBusAddress {
        /// The kernel handle.
        handle: Handle,
    },
    /// Resolve a handle to this process's mapped address (Legacy).
    MapAddressFromHandle {
        /// Process id owning the mapping.
        pid: u32,
        /// The kernel handle.
        handle: Handle,
    },
    /// Resolve a process-local address back to its handle (Legacy).
    MapHandleFromAddress {
        /// Process id owning the mapping.
        pid: u32,
        /// Any address inside the mapping.
        address: usize,
    },
    /// Apply a batch of cache-maintenance operations in one request.
    CleanInvalid {
        /// The sub-ranges to maintain.
        ops: &'a [CacheOp],
    },
    /// CPU begin-access: invalidate the buffer's mapped range (Extended).
    BeginAccess {
        /// The allocation's own descriptor.
        descriptor: BorrowedFd<'a>,
    },
    /// CPU end-access: sync the buffer, flushing unless told not to
    /// (Extended).
    EndAccess {
        /// The allocation's own descriptor.
        descriptor: BorrowedFd<'a>,
        /// Whether to flush dirty host cache lines back.
        flush: bool,
    },
}

/// A successful response from the control channel.
#[derive(Debug)]
pub enum ControlResponse {
    /// A kernel-assigned handle (Legacy allocate/share/import). Zero means
    /// "no handle" in address-to-handle lookups and is never produced by a
    /// successful allocation.
    Handle(Handle),
    /// A dedicated descriptor plus coprocessor identity (Extended
    /// allocate/import).
    Descriptor {
        /// The allocation's own fd; mapping and cache sync go through it.
        descriptor: OwnedFd,
        /// Identifier meaningful only on the coprocessor side.
        coprocessor_handle: u32,
        /// Bus address, absent when it does not fit the coprocessor's
        /// 32-bit addressing.
        bus_address: Option<u32>,
        /// Actual (page-rounded) size of the backing memory.
        size: usize,
    },
    /// An allocation's byte size.
    Size(usize),
    /// An allocation's current cache mode.
    CacheState(CacheMode),
    /// The mmap offset cookie for a handle.
    MapOffset(u64),
    /// A process-local address, absent when the handle has no live mapping.
    Address(Option<usize>),
    /// A coprocessor bus address, absent when unrepresentable.
    BusAddress(Option<u32>),
    /// A coprocessor-side identifier.
    CoprocessorHandle(u32),
    /// The request completed and carries no payload.
    Done,
}

impl ControlResponse {
    pub(crate) fn into_handle(self, op: &'static str) -> Result<Handle> {
        match self {
            ControlResponse::Handle(h) => Ok(h),
            other => Err(protocol_mismatch(op, &other)),
        }
    }

    pub(crate) fn into_size(self, op: &'static str) -> Result<usize> {
        match self {
            ControlResponse::Size(s) => Ok(s),
            other => Err(protocol_mismatch(op, &other)),
        }
    }

    pub(crate) fn into_cache_state(self, op: &'static str) -> Result<CacheMode> {
        match self {
            ControlResponse::CacheState(m) => Ok(m),
            other => Err(protocol_mismatch(op, &other)),
        }
    }

    pub(crate) fn into_descriptor(
        self,
        op: &'static str,
    ) -> Result<(OwnedFd, u32, Option<u32>, usize)> {
        match self {
            ControlResponse::Descriptor {
                descriptor,
                coprocessor_handle,
                bus_address,
                size,
            } => Ok((descriptor, coprocessor_handle, bus_address, size)),
            other => Err(protocol_mismatch(op, &other)),
        }
    }

    pub(crate) fn into_map_offset(self, op: &'static str) -> Result<u64> {
        match self {
            ControlResponse::MapOffset(o) => Ok(o),
            other => Err(protocol_mismatch(op, &other)),
        }
    }

    pub(crate) fn into_address(self, op: &'static str) -> Result<Option<usize>> {
        match self {
            ControlResponse::Address(a) => Ok(a),
            other => Err(protocol_mismatch(op, &other)),
        }
    }
}

fn protocol_mismatch(op: &'static str, got: &ControlResponse) -> Error {
    tracing::error!(op, ?got, "transport returned a mismatched response kind");
    Error::kernel(op, rustix::io::Errno::PROTO)
}

/// The seam between operation semantics and the kernel wire.
///
/// Implementations must be callable from any thread; every call may block
/// on the driver.
pub trait ControlTransport: Send + Sync + std::fmt::Debug {
    /// Submit one request and wait for its response.
    fn submit(&self, request: ControlRequest<'_>) -> Result<ControlResponse>;

    /// The descriptor Legacy allocations are mapped through (at the offset
    /// cookie reported by [`ControlRequest::QueryMapOffset`]).
    fn channel_fd(&self) -> BorrowedFd<'_>;

    /// Tell the transport where a handle got mapped in this process.
    ///
    /// The real driver observes mappings through its own mmap hook, so the
    /// default is a no-op; the mock transport overrides this to answer the
    /// address-translation queries.
    fn record_mapping(&self, handle: Handle, address: usize, size: usize) {
        let _ = (handle, address, size);
    }

    /// Tell the transport a handle's mapping is gone. Default no-op, see
    /// [`ControlTransport::record_mapping`].
    fn forget_mapping(&self, handle: Handle) {
        let _ = handle;
    }
}
