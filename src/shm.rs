//! The shared-memory service: the public operation surface, the
//! process-wide channel registry and the access-window guard.

use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::arena::ARENA_CAPACITY;
use crate::backend::{Backend, BackendOps, ExtendedBackend, LegacyBackend};
use crate::cache::CacheMode;
use crate::error::{Error, Result};
use crate::request::{CacheOp, ControlTransport};
use crate::transport::device::DeviceTransport;
use crate::Handle;

/// One open channel per process. Later `open` calls get the same service
/// back while it is alive; the slot holds a weak reference so dropping the
/// last `Arc` actually closes the channel.
static REGISTRY: OnceLock<Mutex<Weak<Shm>>> = OnceLock::new();

/// A handle-based allocator over coprocessor-visible shared memory.
///
/// All operations go through one of the two kernel transports chosen at
/// open; see [`Backend`] for what each supports. The service is fully
/// thread-safe, but calls on the *same* handle must be externally
/// serialized (the usual pattern is one owner per buffer).
pub struct Shm {
    ops: Box<dyn BackendOps>,
    page_size: usize,
}

impl Shm {
    /// Open the control channel, or return the channel this process
    /// already holds.
    ///
    /// `want_export` asks for the Extended transport so allocations can be
    /// exported as descriptors; if the process already opened the Legacy
    /// transport that request fails rather than silently downgrading.
    /// `external_fd` adopts an already-open channel descriptor (it is
    /// duplicated, the caller keeps ownership of the original).
    pub fn open(want_export: bool, external_fd: Option<BorrowedFd<'_>>) -> Result<Arc<Self>> {
        let registry = REGISTRY.get_or_init(|| Mutex::new(Weak::new()));
        let mut slot = registry.lock().expect("registry mutex poisoned");

        if let Some(existing) = slot.upgrade() {
            if want_export && existing.backend() == Backend::Legacy {
                return Err(Error::InvalidArgument(
                    "channel already open on the legacy backend; export needs extended".into(),
                ));
            }
            return Ok(existing);
        }

        let transport = DeviceTransport::open(want_export, external_fd)?;
        let backend = transport.backend();
        tracing::debug!(%backend, "control channel opened");

        let shm = Self::build(Arc::new(transport), backend, ARENA_CAPACITY);
        *slot = Arc::downgrade(&shm);
        Ok(shm)
    }

    /// Build a service over an arbitrary transport, bypassing the
    /// process-wide registry. This is how tests and embedders with their
    /// own channel management construct the service.
    pub fn with_transport(transport: Arc<dyn ControlTransport>, backend: Backend) -> Arc<Self> {
        Self::build(transport, backend, ARENA_CAPACITY)
    }

    /// [`Shm::with_transport`] with an explicit arena capacity.
    pub fn with_transport_capacity(
        transport: Arc<dyn ControlTransport>,
        backend: Backend,
        capacity: usize,
    ) -> Arc<Self> {
        Self::build(transport, backend, capacity)
    }

    fn build(
        transport: Arc<dyn ControlTransport>,
        backend: Backend,
        capacity: usize,
    ) -> Arc<Self> {
        let page_size = rustix::param::page_size();
        let ops: Box<dyn BackendOps> = match backend {
            Backend::Legacy => Box::new(LegacyBackend::new(transport, page_size)),
            Backend::Extended => Box::new(ExtendedBackend::new(transport, page_size, capacity)),
        };
        Arc::new(Self { ops, page_size })
    }

    /// Which kernel transport this channel speaks.
    pub fn backend(&self) -> Backend {
        self.ops.backend()
    }

    /// The host page size every allocation size is rounded up to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocate `size` bytes of coprocessor-visible memory.
    ///
    /// The size is rounded up to a page multiple; the buffer is mapped into
    /// this process before the handle is returned. `name` is a short debug
    /// label recorded with the allocation.
    pub fn allocate(&self, size: usize, mode: CacheMode, name: &str) -> Result<Handle> {
        if size == 0 {
            return Err(Error::InvalidArgument("allocation size must be nonzero".into()));
        }
        let handle = self.ops.allocate(size, mode, name)?;
        tracing::debug!(handle, size, %mode, name, "allocated");
        Ok(handle)
    }

    /// Release an allocation.
    ///
    /// Always runs to completion: the mapping is removed and the backend
    /// resource released even if individual steps fail (they are logged).
    /// Freeing handle zero or a stale handle is a detected no-op.
    pub fn free(&self, handle: Handle) {
        if handle == 0 {
            tracing::warn!("free of handle zero ignored");
            return;
        }
        self.ops.free(handle);
        tracing::debug!(handle, "freed");
    }

    /// Begin an access window on `handle` and return a guard over it.
    ///
    /// The buffer's host cache lines are invalidated before the pointer is
    /// handed out, so reads observe coprocessor writes.
    pub fn lock(self: &Arc<Self>, handle: Handle) -> Result<AccessGuard> {
        let ptr = self.ops.lock(handle)?;
        // The guard reports the mode it found; lock never moves it.
        Ok(AccessGuard {
            shm: Arc::clone(self),
            handle,
            ptr,
            mode: None,
            released: false,
        })
    }

    /// Begin an access window, asking for `requested` cache behavior.
    ///
    /// The buffer's actual mode moves per the transition rules (which are
    /// deliberately asymmetric; a buffer that was coprocessor-cached does
    /// not become uncached just because one client asked for none). The
    /// guard reports the mode the buffer actually ended up in.
    pub fn lock_cache(
        self: &Arc<Self>,
        handle: Handle,
        requested: CacheMode,
    ) -> Result<AccessGuard> {
        let (ptr, mode) = self.ops.lock_cache(handle, requested)?;
        Ok(AccessGuard {
            shm: Arc::clone(self),
            handle,
            ptr,
            mode: Some(mode),
            released: false,
        })
    }

    fn unlock(&self, handle: Handle, skip_flush: bool) {
        self.ops.unlock(handle, skip_flush);
    }

    /// Produce a second handle referencing the same memory (Legacy only).
    /// Writes through either handle are visible through the other; each
    /// handle is freed independently.
    pub fn share(&self, handle: Handle) -> Result<Handle> {
        self.ops.share(handle)
    }

    /// Grow or shrink an allocation in place (Legacy only). On failure the
    /// buffer keeps its original size and mapping.
    pub fn resize(&self, handle: Handle, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return Err(Error::InvalidArgument("resize to zero is not a free".into()));
        }
        self.ops.resize(handle, new_size)
    }

    /// Register and map memory allocated outside this library. The
    /// descriptor is consumed; the kernel holds its own reference.
    pub fn import_external(&self, fd: OwnedFd, name: &str) -> Result<Handle> {
        self.ops.import_external(fd, name)
    }

    /// Duplicate an allocation's descriptor for a consumer that may
    /// outlive the handle (Extended only).
    pub fn export_external(&self, handle: Handle) -> Result<OwnedFd> {
        self.ops.export_external(handle)
    }

    /// The process-local pointer for a live, mapped handle.
    pub fn address_of(&self, handle: Handle) -> Option<*mut u8> {
        self.ops.address_of(handle)
    }

    /// The handle owning a process-local address, for any address inside
    /// the mapping.
    pub fn handle_of(&self, address: usize) -> Option<Handle> {
        self.ops.handle_of(address)
    }

    /// The coprocessor-side identifier for a handle. Meaningful only to the
    /// coprocessor; never usable for host mapping.
    pub fn coprocessor_handle_of(&self, handle: Handle) -> Result<u32> {
        self.ops.coprocessor_handle_of(handle)
    }

    /// The coprocessor bus address for a handle, absent when it does not
    /// fit 32-bit addressing.
    pub fn coprocessor_bus_address_of(&self, handle: Handle) -> Result<Option<u32>> {
        self.ops.coprocessor_bus_address_of(handle)
    }

    /// Apply a batch of cache-maintenance operations in one request.
    pub fn clean_invalid(&self, ops: &[CacheOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.ops.clean_invalid(ops)
    }

    /// Slots currently in use in the local allocation arena; `None` on the
    /// Legacy backend, which keeps no local bookkeeping.
    pub fn arena_occupancy(&self) -> Option<usize> {
        self.ops.arena_occupancy()
    }
}

impl std::fmt::Debug for Shm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shm")
            .field("backend", &self.backend())
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Close a channel reference.
///
/// The channel itself closes when the last reference drops; buffers still
/// held by other references stay valid.
pub fn close(shm: Arc<Shm>) {
    let backend = shm.backend();
    drop(shm);
    tracing::debug!(%backend, "channel reference released");
}

/// An open access window on a locked buffer.
///
/// Dropping the guard ends the window with a flush, so host writes reach
/// memory before the coprocessor looks. Call [`AccessGuard::unlock`] with
/// `skip_flush` when the window was read-only and the flush is dead work.
#[must_use = "the access window stays open until the guard is dropped"]
pub struct AccessGuard {
    shm: Arc<Shm>,
    handle: Handle,
    ptr: *mut u8,
    mode: Option<CacheMode>,
    released: bool,
}

impl AccessGuard {
    /// The process-local pointer, valid for the life of the guard.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The handle this window is open on.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The cache mode the buffer ended up in, when the window was opened
    /// with [`Shm::lock_cache`].
    pub fn cache_mode(&self) -> Option<CacheMode> {
        self.mode
    }

    /// End the window explicitly. With `skip_flush` the flush-after-write
    /// is omitted; only do this when nothing was written.
    pub fn unlock(mut self, skip_flush: bool) {
        self.released = true;
        self.shm.unlock(self.handle, skip_flush);
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        if !self.released {
            self.shm.unlock(self.handle, false);
        }
    }
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("handle", &self.handle)
            .field("mode", &self.mode)
            .finish()
    }
}
