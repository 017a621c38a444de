//! The Legacy backend.
//!
//! The kernel driver retains every piece of allocation state and answers by
//! handle on each call, so this backend keeps nothing locally: size, cache
//! mode and the process mapping are all queried live. Buffers are mapped
//! through the channel descriptor at a per-handle offset cookie; cache
//! maintenance is expressed as explicit flush/invalidate requests over the
//! mapped range.

use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::Arc;

use rustix::mm::{MapFlags, ProtFlags};

use crate::backend::{Backend, BackendOps};
use crate::cache::{transition, CacheMode};
use crate::error::{Error, Result};
use crate::request::{CacheOp, ControlRequest, ControlTransport};
use crate::Handle;

/// Operation dispatch for the Legacy transport.
pub struct LegacyBackend {
    transport: Arc<dyn ControlTransport>,
    page_size: usize,
}

impl LegacyBackend {
    /// Bind the backend to an open channel transport.
    pub fn new(transport: Arc<dyn ControlTransport>, page_size: usize) -> Self {
        Self {
            transport,
            page_size,
        }
    }

    fn round_up(&self, size: usize) -> usize {
        size.div_ceil(self.page_size) * self.page_size
    }

    fn pid() -> u32 {
        std::process::id()
    }

    fn query_size(&self, handle: Handle) -> Result<usize> {
        self.transport
            .submit(ControlRequest::QuerySize { handle })?
            .into_size("query_size")
    }

    fn mapped_address(&self, handle: Handle) -> Result<Option<usize>> {
        self.transport
            .submit(ControlRequest::MapAddressFromHandle {
                pid: Self::pid(),
                handle,
            })?
            .into_address("map_address_from_handle")
    }

    /// Map `handle`'s offset cookie on the channel descriptor and tell the
    /// transport where it landed.
    fn map_handle(&self, handle: Handle, size: usize) -> Result<*mut u8> {
        let offset = self
            .transport
            .submit(ControlRequest::QueryMapOffset { handle })?
            .into_map_offset("query_map_offset")?;

        // SAFETY: the driver vends one offset window per handle; mapping it
        // shared is exactly how the buffer is intended to be reached.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.transport.channel_fd(),
                offset,
            )?
        };
        self.transport.record_mapping(handle, ptr as usize, size);
        Ok(ptr.cast::<u8>())
    }

    fn unmap(&self, handle: Handle, address: usize, size: usize) {
        // SAFETY: (address, size) came from our own mmap of this handle.
        unsafe {
            if let Err(errno) = rustix::mm::munmap(address as *mut _, size) {
                tracing::warn!(handle, address, size, %errno, "munmap failed");
            }
        }
        self.transport.forget_mapping(handle);
    }

    /// Lock and invalidate; shared tail of `lock` and the no-net-effect
    /// paths of `lock_cache`.
    fn lock_and_invalidate(&self, handle: Handle) -> Result<*mut u8> {
        let size = self.query_size(handle)?;
        let address = self
            .transport
            .submit(ControlRequest::Lock { handle })?
            .into_address("lock")?;

        // A buffer can be resized-but-unmapped; re-establish the mapping.
        let ptr = match address {
            Some(a) => a as *mut u8,
            None => self.map_handle(handle, size)?,
        };

        if let Err(e) = self.transport.submit(ControlRequest::Invalidate {
            address: ptr as usize,
            size,
        }) {
            // The access window never opened; give the lock back.
            self.best_effort_unlock(handle);
            return Err(e);
        }
        Ok(ptr)
    }

    fn best_effort_unlock(&self, handle: Handle) {
        if let Err(errno) = self.transport.submit(ControlRequest::Unlock { handle }) {
            tracing::warn!(handle, error = %errno, "unlock during unwind failed");
        }
    }
}

impl std::fmt::Debug for LegacyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyBackend")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl BackendOps for LegacyBackend {
    fn backend(&self) -> Backend {
        Backend::Legacy
    }

    fn allocate(&self, size: usize, mode: CacheMode, name: &str) -> Result<Handle> {
        let size = self.round_up(size);
        let handle = self
            .transport
            .submit(ControlRequest::Allocate { size, mode, name })?
            .into_handle("allocate")?;

        match self.map_handle(handle, size) {
            Ok(_) => Ok(handle),
            Err(e) => {
                // The kernel-side resource exists; do not leak it.
                if let Err(free_err) = self.transport.submit(ControlRequest::Free { handle }) {
                    tracing::error!(handle, error = %free_err, "free during allocate unwind failed");
                }
                Err(e)
            }
        }
    }

    fn free(&self, handle: Handle) {
        // Unmap, then release. Every step runs; failures are logged, the
        // driver reclaims at channel close either way.
        match (self.query_size(handle), self.mapped_address(handle)) {
            (Ok(size), Ok(Some(address))) => self.unmap(handle, address, size),
            (Ok(_), Ok(None)) => {}
            (size_result, addr_result) => {
                tracing::warn!(
                    handle,
                    size_err = ?size_result.err(),
                    addr_err = ?addr_result.err(),
                    "could not resolve mapping during free"
                );
            }
        }
        if let Err(errno) = self.transport.submit(ControlRequest::Free { handle }) {
            tracing::warn!(handle, error = %errno, "free request failed");
        }
    }

    fn share(&self, handle: Handle) -> Result<Handle> {
        let new_handle = self
            .transport
            .submit(ControlRequest::Share { handle })?
            .into_handle("share")?;
        let size = self.query_size(new_handle)?;
        match self.map_handle(new_handle, size) {
            Ok(_) => Ok(new_handle),
            Err(e) => {
                if let Err(free_err) = self
                    .transport
                    .submit(ControlRequest::Free { handle: new_handle })
                {
                    tracing::error!(
                        handle = new_handle,
                        error = %free_err,
                        "free during share unwind failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn resize(&self, handle: Handle, new_size: usize) -> Result<()> {
        let new_size = self.round_up(new_size);
        let old_size = self.query_size(handle)?;
        if let Some(address) = self.mapped_address(handle)? {
            self.unmap(handle, address, old_size);
        }

        if let Err(e) = self
            .transport
            .submit(ControlRequest::Resize { handle, new_size })
        {
            // All-or-nothing: the allocation still has its original size,
            // restore the mapping so the caller's buffer stays usable.
            if let Err(remap) = self.map_handle(handle, old_size) {
                tracing::error!(handle, error = %remap, "remap after failed resize failed");
            }
            return Err(e);
        }

        // A failure here leaves the buffer resized but unmapped; the caller
        // learns about it and can retry the mapping via `lock`.
        self.map_handle(handle, new_size)?;
        Ok(())
    }

    fn import_external(&self, fd: OwnedFd, name: &str) -> Result<Handle> {
        let handle = self
            .transport
            .submit(ControlRequest::Import {
                fd: fd.as_fd(),
                mode: CacheMode::Host,
                name,
            })?
            .into_handle("import")?;

        let size = self.query_size(handle)?;
        match self.map_handle(handle, size) {
            Ok(_) => Ok(handle),
            Err(e) => {
                if let Err(free_err) = self.transport.submit(ControlRequest::Free { handle }) {
                    tracing::error!(handle, error = %free_err, "free during import unwind failed");
                }
                Err(e)
            }
        }
    }

    fn export_external(&self, _handle: Handle) -> Result<OwnedFd> {
        Err(Error::UnsupportedOnBackend {
            op: "export_external",
            backend: Backend::Legacy,
        })
    }

    fn lock(&self, handle: Handle) -> Result<*mut u8> {
        self.lock_and_invalidate(handle)
    }

    fn lock_cache(&self, handle: Handle, requested: CacheMode) -> Result<(*mut u8, CacheMode)> {
        let current = self
            .transport
            .submit(ControlRequest::QueryCacheState { handle })?
            .into_cache_state("query_cache_state")?;

        // Diagonal short-circuit: never consult the table.
        if requested == current {
            return Ok((self.lock_and_invalidate(handle)?, current));
        }

        let resulting = transition(current, requested);
        if resulting == current {
            // The request had no net effect; plain lock.
            return Ok((self.lock_and_invalidate(handle)?, current));
        }

        // A real mode change: unmap, relock with the new mode, remap,
        // invalidate.
        let size = self.query_size(handle)?;
        if let Some(address) = self.mapped_address(handle)? {
            self.unmap(handle, address, size);
        }

        self.transport.submit(ControlRequest::LockWithCacheMode {
            handle,
            mode: resulting,
        })?;

        let ptr = match self.map_handle(handle, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.best_effort_unlock(handle);
                return Err(e);
            }
        };

        if let Err(e) = self.transport.submit(ControlRequest::Invalidate {
            address: ptr as usize,
            size,
        }) {
            self.best_effort_unlock(handle);
            return Err(e);
        }

        Ok((ptr, resulting))
    }

    fn unlock(&self, handle: Handle, skip_flush: bool) {
        let resolved = match (self.mapped_address(handle), self.query_size(handle)) {
            (Ok(addr), Ok(size)) => addr.map(|a| (a, size)),
            (addr_result, size_result) => {
                tracing::warn!(
                    handle,
                    addr_err = ?addr_result.err(),
                    size_err = ?size_result.err(),
                    "could not resolve mapping during unlock"
                );
                None
            }
        };

        if !skip_flush {
            if let Some((address, size)) = resolved {
                if let Err(errno) = self
                    .transport
                    .submit(ControlRequest::Flush { address, size })
                {
                    tracing::warn!(handle, error = %errno, "flush during unlock failed");
                }
            }
        }

        if let Err(errno) = self.transport.submit(ControlRequest::Unlock { handle }) {
            tracing::warn!(handle, error = %errno, "unlock request failed");
        }
    }

    fn address_of(&self, handle: Handle) -> Option<*mut u8> {
        self.mapped_address(handle)
            .ok()
            .flatten()
            .map(|a| a as *mut u8)
    }

    fn handle_of(&self, address: usize) -> Option<Handle> {
        let handle = self
            .transport
            .submit(ControlRequest::MapHandleFromAddress {
                pid: Self::pid(),
                address,
            })
            .ok()?
            .into_handle("map_handle_from_address")
            .ok()?;
        (handle != 0).then_some(handle)
    }

    fn coprocessor_handle_of(&self, handle: Handle) -> Result<u32> {
        match self
            .transport
            .submit(ControlRequest::QueryCoprocessorHandle { handle })?
        {
            crate::request::ControlResponse::CoprocessorHandle(id) => Ok(id),
            _ => Err(Error::kernel(
                "query_coprocessor_handle",
                rustix::io::Errno::PROTO,
            )),
        }
    }

    fn coprocessor_bus_address_of(&self, handle: Handle) -> Result<Option<u32>> {
        match self
            .transport
            .submit(ControlRequest::QueryBusAddress { handle })?
        {
            crate::request::ControlResponse::BusAddress(bus) => Ok(bus),
            _ => Err(Error::kernel("query_bus_address", rustix::io::Errno::PROTO)),
        }
    }

    fn clean_invalid(&self, ops: &[CacheOp]) -> Result<()> {
        // The Legacy wire form is 32-bit; wider ranges belong to the
        // Extended backend and this path is deprecated for them. The wire
        // carries (address, size), so a range may end exactly at the 4 GiB
        // ceiling.
        for op in ops {
            let fits = (op.address as u64)
                .checked_add(op.size as u64)
                .is_some_and(|end| end <= u64::from(u32::MAX) + 1);
            if !fits {
                return Err(Error::InvalidArgument(format!(
                    "cache op at {:#x}+{:#x} exceeds the Legacy 32-bit wire form",
                    op.address, op.size
                )));
            }
        }
        self.transport
            .submit(ControlRequest::CleanInvalid { ops })?;
        Ok(())
    }

    fn arena_occupancy(&self) -> Option<usize> {
        None
    }
}
