//! In-process transport implementing the control vocabulary over memfds.
//!
//! The mock exists so the allocator's semantics can be exercised without the
//! kernel driver present: real mappings, real descriptors, fake coprocessor.
//! The Legacy flavor carves page-aligned windows out of a single channel
//! memfd (the mmap offset cookie points into it); each window carries 1 MiB
//! of slack so in-place resize has room, and resizing past the window fails
//! with `ENOMEM` exactly like a driver that cannot grow an allocation. The
//! Extended flavor hands out dedicated memfds plus synthesized coprocessor
//! handles and 32-bit bus addresses (absent when the buffer cannot be
//! represented in 32 bits).
//!
//! Imports diverge between the flavors: the Extended mock dups the external
//! descriptor, so the imported handle genuinely aliases the caller's memory;
//! the Legacy mock has no way to splice foreign pages into its channel
//! memfd, so it seeds the new window with the external contents at import
//! time and later writes do not propagate back to the external descriptor.
//!
//! Cache-maintenance requests have no observable memory effect on a
//! cache-coherent test host, so the mock counts them instead; tests assert
//! on the counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use rustix::fs::MemfdFlags;

use crate::backend::Backend;
use crate::cache::CacheMode;
use crate::error::{Error, Result};
use crate::request::{ControlRequest, ControlResponse, ControlTransport};
use crate::Handle;

/// Slack granted to every Legacy window so resize can grow in place.
const WINDOW_SLACK: u64 = 1 << 20;

#[derive(Debug)]
struct LegacyBuf {
    offset: u64,
    window: u64,
    size: usize,
    cache: CacheMode,
    mapped: Option<(usize, usize)>,
    locks: u32,
    coprocessor_handle: u32,
    bus_address: Option<u32>,
}

#[derive(Debug)]
struct MockState {
    next_handle: Handle,
    next_offset: u64,
    buffers: HashMap<Handle, LegacyBuf>,
    next_coprocessor_handle: u32,
    next_bus_address: u64,
}

/// Counters observable by tests; cache maintenance is otherwise invisible
/// on a coherent host.
#[derive(Debug, Default)]
struct Counters {
    begin_access: AtomicUsize,
    end_access_flush: AtomicUsize,
    end_access_skip: AtomicUsize,
    flushes: AtomicUsize,
    invalidates: AtomicUsize,
    clean_invalid_ops: AtomicUsize,
}

/// Mock control transport. One instance per simulated channel.
#[derive(Debug)]
pub struct MockTransport {
    backend: Backend,
    chan: OwnedFd,
    state: Mutex<MockState>,
    counters: Counters,
}

impl MockTransport {
    /// A mock channel speaking the Legacy vocabulary.
    pub fn legacy() -> Result<Self> {
        Self::new(Backend::Legacy)
    }

    /// A mock channel speaking the Extended vocabulary.
    pub fn extended() -> Result<Self> {
        Self::new(Backend::Extended)
    }

    fn new(backend: Backend) -> Result<Self> {
        let chan = rustix::fs::memfd_create("coshm-mock-channel", MemfdFlags::CLOEXEC)?;
        Ok(Self {
            backend,
            chan,
            state: Mutex::new(MockState {
                next_handle: 1,
                next_offset: 0,
                buffers: HashMap::new(),
                next_coprocessor_handle: 0x100,
                next_bus_address: 0xC000_0000,
            }),
            counters: Counters::default(),
        })
    }

    /// The backend vocabulary this mock speaks.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// CPU begin-access syncs observed (Extended).
    pub fn begin_access_count(&self) -> usize {
        self.counters.begin_access.load(Ordering::Relaxed)
    }

    /// CPU end-access syncs that included a flush (Extended).
    pub fn end_access_flush_count(&self) -> usize {
        self.counters.end_access_flush.load(Ordering::Relaxed)
    }

    /// CPU end-access syncs that skipped the flush (Extended).
    pub fn end_access_skip_count(&self) -> usize {
        self.counters.end_access_skip.load(Ordering::Relaxed)
    }

    /// Flush requests observed (Legacy).
    pub fn flush_count(&self) -> usize {
        self.counters.flushes.load(Ordering::Relaxed)
    }

    /// Invalidate requests observed (Legacy).
    pub fn invalidate_count(&self) -> usize {
        self.counters.invalidates.load(Ordering::Relaxed)
    }

    /// Total bulk-maintenance sub-ranges observed.
    pub fn clean_invalid_op_count(&self) -> usize {
        self.counters.clean_invalid_ops.load(Ordering::Relaxed)
    }

    /// Live simulated kernel-side allocations (Legacy).
    pub fn live_buffers(&self) -> usize {
        self.state.lock().expect("mock mutex poisoned").buffers.len()
    }

    fn assign_bus_address(state: &mut MockState, size: usize) -> Option<u32> {
        let end = state.next_bus_address.checked_add(size as u64)?;
        if end > u64::from(u32::MAX) {
            return None;
        }
        let bus = state.next_bus_address as u32;
        state.next_bus_address = end;
        Some(bus)
    }

    fn legacy_allocate(&self, size: usize, cache: CacheMode) -> Result<Handle> {
        let mut state = self.state.lock().expect("mock mutex poisoned");

        let window = (size as u64).div_ceil(WINDOW_SLACK) * WINDOW_SLACK + WINDOW_SLACK;
        let offset = state.next_offset;
        state.next_offset += window;
        rustix::fs::ftruncate(&self.chan, state.next_offset)?;

        let handle = state.next_handle;
        state.next_handle += 1;

        let coprocessor_handle = state.next_coprocessor_handle;
        state.next_coprocessor_handle += 1;
        let bus_address = Self::assign_bus_address(&mut state, size);

        state.buffers.insert(
            handle,
            LegacyBuf {
                offset,
                window,
                size,
                cache,
                mapped: None,
                locks: 0,
                coprocessor_handle,
                bus_address,
            },
        );
        Ok(handle)
    }

    fn submit_legacy(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        match request {
            ControlRequest::Allocate { size, mode, .. } => {
                let handle = self.legacy_allocate(size, mode)?;
                Ok(ControlResponse::Handle(handle))
            }
            ControlRequest::Free { handle } => {
                let mut state = self.state.lock().expect("mock mutex poisoned");
                state
                    .buffers
                    .remove(&handle)
                    .ok_or(Error::kernel("free", rustix::io::Errno::NOENT))?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Resize { handle, new_size } => {
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let buf = state
                    .buffers
                    .get_mut(&handle)
                    .ok_or(Error::kernel("resize", rustix::io::Errno::NOENT))?;
                if new_size as u64 > buf.window {
                    // The window cannot grow in place.
                    return Err(Error::kernel("resize", rustix::io::Errno::NOMEM));
                }
                buf.size = new_size;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Share { handle } => {
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let src = state
                    .buffers
                    .get(&handle)
                    .ok_or(Error::kernel("share", rustix::io::Errno::NOENT))?;
                let alias = LegacyBuf {
                    offset: src.offset,
                    window: src.window,
                    size: src.size,
                    cache: src.cache,
                    mapped: None,
                    locks: 0,
                    coprocessor_handle: src.coprocessor_handle,
                    bus_address: src.bus_address,
                };
                let new_handle = state.next_handle;
                state.next_handle += 1;
                state.buffers.insert(new_handle, alias);
                Ok(ControlResponse::Handle(new_handle))
            }
            ControlRequest::Lock { handle } => {
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let buf = state
                    .buffers
                    .get_mut(&handle)
                    .ok_or(Error::kernel("lock", rustix::io::Errno::NOENT))?;
                buf.locks += 1;
                Ok(ControlResponse::Address(buf.mapped.map(|(a, _)| a)))
            }
            ControlRequest::LockWithCacheMode { handle, mode } => {
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let buf = state
                    .buffers
                    .get_mut(&handle)
                    .ok_or(Error::kernel("lock_cache", rustix::io::Errno::NOENT))?;
                buf.cache = mode;
                buf.locks += 1;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Unlock { handle } => {
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let buf = state
                    .buffers
                    .get_mut(&handle)
                    .ok_or(Error::kernel("unlock", rustix::io::Errno::NOENT))?;
                if buf.locks == 0 {
                    return Err(Error::kernel("unlock", rustix::io::Errno::PERM));
                }
                buf.locks -= 1;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Flush { .. } => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(ControlResponse::Done)
            }
            ControlRequest::Invalidate { .. } => {
                self.counters.invalidates.fetch_add(1, Ordering::Relaxed);
                Ok(ControlResponse::Done)
            }
            ControlRequest::Import { fd, mode, .. } => {
                let stat = rustix::fs::fstat(fd)?;
                let size = stat.st_size as usize;
                let mut contents = vec![0u8; size];
                let n = rustix::io::pread(fd, &mut contents, 0)?;

                let handle = self.legacy_allocate(size, mode)?;
                let offset = {
                    let state = self.state.lock().expect("mock mutex poisoned");
                    state.buffers[&handle].offset
                };
                // Seed the window so imported contents are readable; see
                // the module docs for the aliasing divergence.
                rustix::io::pwrite(&self.chan, &contents[..n], offset)?;
                Ok(ControlResponse::Handle(handle))
            }
            ControlRequest::QuerySize { handle } => {
                self.with_buf("query_size", handle, |buf| ControlResponse::Size(buf.size))
            }
            ControlRequest::QueryCacheState { handle } => self
                .with_buf("query_cache_state", handle, |buf| {
                    ControlResponse::CacheState(buf.cache)
                }),
            ControlRequest::QueryMapOffset { handle } => self
                .with_buf("query_map_offset", handle, |buf| {
                    ControlResponse::MapOffset(buf.offset)
                }),
            ControlRequest::QueryCoprocessorHandle { handle } => self
                .with_buf("query_coprocessor_handle", handle, |buf| {
                    ControlResponse::CoprocessorHandle(buf.coprocessor_handle)
                }),
            ControlRequest::QueryBusAddress { handle } => self
                .with_buf("query_bus_address", handle, |buf| {
                    ControlResponse::BusAddress(buf.bus_address)
                }),
            ControlRequest::MapAddressFromHandle { handle, .. } => self
                .with_buf("map_address_from_handle", handle, |buf| {
                    ControlResponse::Address(buf.mapped.map(|(a, _)| a))
                }),
            ControlRequest::MapHandleFromAddress { address, .. } => {
                let state = self.state.lock().expect("mock mutex poisoned");
                let found = state.buffers.iter().find_map(|(h, buf)| {
                    let (base, len) = buf.mapped?;
                    (address >= base && address < base + len).then_some(*h)
                });
                Ok(ControlResponse::Handle(found.unwrap_or(0)))
            }
            ControlRequest::CleanInvalid { ops } => {
                self.counters
                    .clean_invalid_ops
                    .fetch_add(ops.len(), Ordering::Relaxed);
                Ok(ControlResponse::Done)
            }
            ControlRequest::BeginAccess { .. } | ControlRequest::EndAccess { .. } => Err(
                Error::InvalidArgument("descriptor sync is not in the Legacy vocabulary".into()),
            ),
        }
    }

    fn with_buf(
        &self,
        op: &'static str,
        handle: Handle,
        f: impl FnOnce(&LegacyBuf) -> ControlResponse,
    ) -> Result<ControlResponse> {
        let state = self.state.lock().expect("mock mutex poisoned");
        let buf = state
            .buffers
            .get(&handle)
            .ok_or(Error::kernel(op, rustix::io::Errno::NOENT))?;
        Ok(f(buf))
    }

    fn submit_extended(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        match request {
            ControlRequest::Allocate { size, name, .. } => {
                let descriptor = rustix::fs::memfd_create(
                    if name.is_empty() { "coshm-mock" } else { name },
                    MemfdFlags::CLOEXEC,
                )?;
                rustix::fs::ftruncate(&descriptor, size as u64)?;
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let coprocessor_handle = state.next_coprocessor_handle;
                state.next_coprocessor_handle += 1;
                let bus_address = Self::assign_bus_address(&mut state, size);
                Ok(ControlResponse::Descriptor {
                    descriptor,
                    coprocessor_handle,
                    bus_address,
                    size,
                })
            }
            ControlRequest::Import { fd, .. } => {
                let stat = rustix::fs::fstat(fd)?;
                let size = stat.st_size as usize;
                let descriptor = fd.try_clone_to_owned()?;
                let mut state = self.state.lock().expect("mock mutex poisoned");
                let coprocessor_handle = state.next_coprocessor_handle;
                state.next_coprocessor_handle += 1;
                let bus_address = Self::assign_bus_address(&mut state, size);
                Ok(ControlResponse::Descriptor {
                    descriptor,
                    coprocessor_handle,
                    bus_address,
                    size,
                })
            }
            ControlRequest::BeginAccess { .. } => {
                self.counters.begin_access.fetch_add(1, Ordering::Relaxed);
                Ok(ControlResponse::Done)
            }
            ControlRequest::EndAccess { flush, .. } => {
                if flush {
                    self.counters.end_access_flush.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.end_access_skip.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ControlResponse::Done)
            }
            ControlRequest::CleanInvalid { ops } => {
                self.counters
                    .clean_invalid_ops
                    .fetch_add(ops.len(), Ordering::Relaxed);
                Ok(ControlResponse::Done)
            }
            other => Err(Error::InvalidArgument(format!(
                "request {other:?} is not in the Extended vocabulary"
            ))),
        }
    }
}

impl ControlTransport for MockTransport {
    fn submit(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        match self.backend {
            Backend::Legacy => self.submit_legacy(request),
            Backend::Extended => self.submit_extended(request),
        }
    }

    fn channel_fd(&self) -> BorrowedFd<'_> {
        self.chan.as_fd()
    }

    fn record_mapping(&self, handle: Handle, address: usize, size: usize) {
        let mut state = self.state.lock().expect("mock mutex poisoned");
        if let Some(buf) = state.buffers.get_mut(&handle) {
            buf.mapped = Some((address, size));
        }
    }

    fn forget_mapping(&self, handle: Handle) {
        let mut state = self.state.lock().expect("mock mutex poisoned");
        if let Some(buf) = state.buffers.get_mut(&handle) {
            buf.mapped = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_allocate_assigns_nonzero_handles() {
        let mock = MockTransport::legacy().unwrap();
        let resp = mock
            .submit(ControlRequest::Allocate {
                size: 4096,
                mode: CacheMode::Host,
                name: "a",
            })
            .unwrap();
        let h = resp.into_handle("allocate").unwrap();
        assert_ne!(h, 0);
        assert_eq!(mock.live_buffers(), 1);
    }

    #[test]
    fn test_legacy_mapping_notifications_answer_queries() {
        let mock = MockTransport::legacy().unwrap();
        let h = mock
            .submit(ControlRequest::Allocate {
                size: 4096,
                mode: CacheMode::Host,
                name: "b",
            })
            .unwrap()
            .into_handle("allocate")
            .unwrap();

        mock.record_mapping(h, 0x7f00_0000, 4096);
        let addr = mock
            .submit(ControlRequest::MapAddressFromHandle { pid: 1, handle: h })
            .unwrap()
            .into_address("map_address_from_handle")
            .unwrap();
        assert_eq!(addr, Some(0x7f00_0000));

        let back = mock
            .submit(ControlRequest::MapHandleFromAddress {
                pid: 1,
                address: 0x7f00_0800,
            })
            .unwrap()
            .into_handle("map_handle_from_address")
            .unwrap();
        assert_eq!(back, h);

        mock.forget_mapping(h);
        let addr = mock
            .submit(ControlRequest::MapAddressFromHandle { pid: 1, handle: h })
            .unwrap()
            .into_address("map_address_from_handle")
            .unwrap();
        assert_eq!(addr, None);
    }

    #[test]
    fn test_legacy_resize_past_window_fails() {
        let mock = MockTransport::legacy().unwrap();
        let h = mock
            .submit(ControlRequest::Allocate {
                size: 4096,
                mode: CacheMode::Host,
                name: "c",
            })
            .unwrap()
            .into_handle("allocate")
            .unwrap();

        // Within the slack window: fine.
        assert!(mock
            .submit(ControlRequest::Resize {
                handle: h,
                new_size: 64 * 1024,
            })
            .is_ok());

        // Past the window: the simulated driver cannot grow in place.
        let err = mock
            .submit(ControlRequest::Resize {
                handle: h,
                new_size: 64 << 20,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::KernelRequestFailed {
                errno: rustix::io::Errno::NOMEM,
                ..
            }
        ));
    }

    #[test]
    fn test_extended_allocate_yields_dedicated_descriptor() {
        let mock = MockTransport::extended().unwrap();
        let resp = mock
            .submit(ControlRequest::Allocate {
                size: 8192,
                mode: CacheMode::Host,
                name: "d",
            })
            .unwrap();
        match resp {
            ControlResponse::Descriptor {
                descriptor,
                coprocessor_handle,
                bus_address,
                size,
            } => {
                assert_eq!(size, 8192);
                assert_ne!(coprocessor_handle, 0);
                assert!(bus_address.is_some());
                let stat = rustix::fs::fstat(&descriptor).unwrap();
                assert_eq!(stat.st_size, 8192);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_extended_bus_address_exhaustion_reports_absent() {
        let mock = MockTransport::extended().unwrap();
        // The mock's bus window starts at 3 GiB; 2 GiB cannot fit below
        // the 32-bit ceiling.
        let resp = mock
            .submit(ControlRequest::Allocate {
                size: 2 << 30,
                mode: CacheMode::None,
                name: "huge",
            })
            .unwrap();
        match resp {
            ControlResponse::Descriptor { bus_address, .. } => {
                assert_eq!(bus_address, None);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
