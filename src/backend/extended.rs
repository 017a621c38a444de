//! The Extended backend.
//!
//! Each allocation owns a dedicated descriptor; the kernel keeps no
//! per-handle state beyond the fd, so the bookkeeping (size, cache mode,
//! mapping, coprocessor identity) lives in the user-space arena. Cache
//! maintenance is expressed as begin/end access-window syncs on the
//! allocation's own descriptor instead of flush/invalidate by address.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Arc;

use rustix::mm::{MapFlags, ProtFlags};

use crate::arena::SlotArena;
use crate::backend::{Backend, BackendOps};
use crate::cache::{transition, CacheMode};
use crate::error::{Error, Result};
use crate::request::{CacheOp, ControlRequest, ControlTransport};
use crate::Handle;

/// User-space bookkeeping for one live allocation.
struct Allocation {
    descriptor: OwnedFd,
    size: usize,
    cache_mode: CacheMode,
    mapped: NonNull<u8>,
    coprocessor_handle: u32,
    bus_address: Option<u32>,
}

// SAFETY: `mapped` is a plain mapped address, not a thread-affine resource;
// the arena mutex serializes all access to the slot.
unsafe impl Send for Allocation {}

/// Operation dispatch for the Extended transport.
pub struct ExtendedBackend {
    transport: Arc<dyn ControlTransport>,
    page_size: usize,
    arena: SlotArena<Allocation>,
}

impl ExtendedBackend {
    /// Bind the backend to an open channel transport, with room for
    /// `capacity` concurrent allocations.
    pub fn new(transport: Arc<dyn ControlTransport>, page_size: usize, capacity: usize) -> Self {
        Self {
            transport,
            page_size,
            arena: SlotArena::new(capacity),
        }
    }

    fn round_up(&self, size: usize) -> usize {
        size.div_ceil(self.page_size) * self.page_size
    }

    fn map_descriptor(&self, descriptor: BorrowedFd<'_>, size: usize) -> Result<NonNull<u8>> {
        // SAFETY: mapping a descriptor the kernel just vended for exactly
        // this purpose, at offset zero over its full size.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                descriptor,
                0,
            )?
        };
        // mmap never returns null on success.
        Ok(NonNull::new(ptr.cast::<u8>()).expect("mmap returned null"))
    }

    fn unmap(&self, address: NonNull<u8>, size: usize) {
        // SAFETY: (address, size) came from our own mmap of this allocation.
        unsafe {
            if let Err(errno) = rustix::mm::munmap(address.as_ptr().cast(), size) {
                tracing::warn!(address = ?address, size, %errno, "munmap failed");
            }
        }
    }

    /// Map a freshly received descriptor and register it in the arena,
    /// unwinding completely on failure.
    fn adopt(
        &self,
        descriptor: OwnedFd,
        size: usize,
        cache_mode: CacheMode,
        coprocessor_handle: u32,
        bus_address: Option<u32>,
        name: &str,
    ) -> Result<Handle> {
        if bus_address.is_none() {
            tracing::warn!(name, coprocessor_handle, "allocation has no 32-bit bus address");
        }

        let mapped = self.map_descriptor(descriptor.as_fd(), size)?;
        // Descriptor drops on the error path; the kernel reclaims with it.

        let allocation = Allocation {
            descriptor,
            size,
            cache_mode,
            mapped,
            coprocessor_handle,
            bus_address,
        };
        match self.arena.insert(allocation) {
            Some(handle) => Ok(handle),
            None => {
                // The descriptor closed when the rejected Allocation
                // dropped inside `insert`; only the mapping is left.
                self.unmap(mapped, size);
                Err(Error::ResourceExhausted("allocation arena full"))
            }
        }
    }

    /// Pull the fields a kernel request needs out of the slot without
    /// holding the arena lock across the request itself.
    fn snapshot(&self, handle: Handle) -> Option<(RawFd, NonNull<u8>, usize, CacheMode)> {
        self.arena.with(handle, |a| {
            (a.descriptor.as_raw_fd(), a.mapped, a.size, a.cache_mode)
        })
    }

    fn unknown(handle: Handle) -> Error {
        Error::InvalidArgument(format!("unknown or stale handle {handle:#x}"))
    }

    fn begin_access(&self, descriptor: RawFd) -> Result<()> {
        // SAFETY: the raw fd came out of a live arena slot; the slot cannot
        // be vacated concurrently because callers on the same handle are
        // serialized by contract.
        let borrowed = unsafe { BorrowedFd::borrow_raw(descriptor) };
        self.transport.submit(ControlRequest::BeginAccess {
            descriptor: borrowed,
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for ExtendedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedBackend")
            .field("page_size", &self.page_size)
            .field("arena", &self.arena)
            .finish()
    }
}

impl BackendOps for ExtendedBackend {
    fn backend(&self) -> Backend {
        Backend::Extended
    }

    fn allocate(&self, size: usize, mode: CacheMode, name: &str) -> Result<Handle> {
        let size = self.round_up(size);
        let (descriptor, coprocessor_handle, bus_address, real_size) = self
            .transport
            .submit(ControlRequest::Allocate { size, mode, name })?
            .into_descriptor("allocate")?;
        self.adopt(
            descriptor,
            real_size,
            mode,
            coprocessor_handle,
            bus_address,
            name,
        )
    }

    fn free(&self, handle: Handle) {
        let Some(allocation) = self.arena.remove(handle) else {
            tracing::warn!(handle, "free of unknown or stale handle ignored");
            return;
        };
        self.unmap(allocation.mapped, allocation.size);
        // Dropping the descriptor is the release; the kernel frees the
        // memory once every mapping and duplicate fd is gone.
        drop(allocation.descriptor);
    }

    fn share(&self, _handle: Handle) -> Result<Handle> {
        Err(Error::UnsupportedOnBackend {
            op: "share",
            backend: Backend::Extended,
        })
    }

    fn resize(&self, _handle: Handle, _new_size: usize) -> Result<()> {
        Err(Error::UnsupportedOnBackend {
            op: "resize",
            backend: Backend::Extended,
        })
    }

    fn import_external(&self, fd: OwnedFd, name: &str) -> Result<Handle> {
        let (descriptor, coprocessor_handle, bus_address, size) = self
            .transport
            .submit(ControlRequest::Import {
                fd: fd.as_fd(),
                mode: CacheMode::Host,
                name,
            })?
            .into_descriptor("import")?;
        // The kernel holds its own reference now; the caller's fd closes
        // when `fd` drops at the end of this call.
        self.adopt(
            descriptor,
            size,
            CacheMode::Host,
            coprocessor_handle,
            bus_address,
            name,
        )
    }

    fn export_external(&self, handle: Handle) -> Result<OwnedFd> {
        self.arena
            .with(handle, |a| a.descriptor.try_clone())
            .ok_or_else(|| Self::unknown(handle))?
            .map_err(Error::from)
    }

    fn lock(&self, handle: Handle) -> Result<*mut u8> {
        let (descriptor, mapped, _, _) = self.snapshot(handle).ok_or_else(|| Self::unknown(handle))?;
        self.begin_access(descriptor)?;
        Ok(mapped.as_ptr())
    }

    fn lock_cache(&self, handle: Handle, requested: CacheMode) -> Result<(*mut u8, CacheMode)> {
        let (descriptor, mapped, _, current) =
            self.snapshot(handle).ok_or_else(|| Self::unknown(handle))?;

        // The mode is fixed at allocation on this backend; anything that
        // would actually move it is refused. A request that the table says
        // has no net effect is just a lock.
        if requested != current && transition(current, requested) != current {
            return Err(Error::UnsupportedOnBackend {
                op: "lock_cache",
                backend: Backend::Extended,
            });
        }

        self.begin_access(descriptor)?;
        Ok((mapped.as_ptr(), current))
    }

    fn unlock(&self, handle: Handle, skip_flush: bool) {
        let Some((descriptor, _, _, _)) = self.snapshot(handle) else {
            tracing::warn!(handle, "unlock of unknown or stale handle ignored");
            return;
        };
        // SAFETY: see `begin_access`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(descriptor) };
        if let Err(errno) = self.transport.submit(ControlRequest::EndAccess {
            descriptor: borrowed,
            flush: !skip_flush,
        }) {
            tracing::warn!(handle, error = %errno, "end-access during unlock failed");
        }
    }

    fn address_of(&self, handle: Handle) -> Option<*mut u8> {
        self.arena.with(handle, |a| a.mapped.as_ptr())
    }

    fn handle_of(&self, address: usize) -> Option<Handle> {
        self.arena.find(|handle, a| {
            let base = a.mapped.as_ptr() as usize;
            (address >= base && address < base + a.size).then_some(handle)
        })
    }

    fn coprocessor_handle_of(&self, handle: Handle) -> Result<u32> {
        self.arena
            .with(handle, |a| a.coprocessor_handle)
            .ok_or_else(|| Self::unknown(handle))
    }

    fn coprocessor_bus_address_of(&self, handle: Handle) -> Result<Option<u32>> {
        self.arena
            .with(handle, |a| a.bus_address)
            .ok_or_else(|| Self::unknown(handle))
    }

    fn clean_invalid(&self, ops: &[CacheOp]) -> Result<()> {
        self.transport
            .submit(ControlRequest::CleanInvalid { ops })?;
        Ok(())
    }

    fn arena_occupancy(&self) -> Option<usize> {
        Some(self.arena.occupancy())
    }
}
