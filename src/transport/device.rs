//! The real kernel transport.
//!
//! Every [`ControlRequest`] is lowered to a `#[repr(C)]` request struct and
//! submitted with a single blocking ioctl, either on the channel descriptor
//! or (for the Extended begin/end-access sync) on the allocation's own
//! descriptor. The two backend vocabularies use disjoint ioctl number
//! spaces; submitting a request outside the active backend's vocabulary is
//! rejected before it reaches the driver.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::fs::{Mode, OFlags};

use crate::backend::Backend;
use crate::cache::CacheMode;
use crate::error::{Error, Result};
use crate::request::{CacheOp, ControlRequest, ControlResponse, ControlTransport};

/// Device node for the Legacy backend.
pub const LEGACY_DEVICE: &str = "/dev/coshm";

/// Device node for the Extended backend.
pub const EXTENDED_DEVICE: &str = "/dev/coshm-ext";

// ---------------------------------------------------------------------------
// ioctl plumbing
// ---------------------------------------------------------------------------

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

const fn iow<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u8) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

fn last_errno() -> rustix::io::Errno {
    let raw = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    rustix::io::Errno::from_raw_os_error(raw)
}

fn ioctl_on<T>(
    fd: BorrowedFd<'_>,
    op: &'static str,
    request: libc::c_ulong,
    arg: &mut T,
) -> Result<()> {
    // SAFETY: `request` was built from `T`'s size, `arg` is a valid
    // exclusive reference for the duration of the call, and `fd` is open.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request, arg as *mut T) };
    if ret < 0 {
        return Err(Error::kernel(op, last_errno()));
    }
    Ok(())
}

/// Copy `name` into a fixed wire field, NUL-terminated and truncated.
fn put_name(dst: &mut [u8; NAME_LEN], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
}

const NAME_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Legacy wire structs (magic 'C')
// ---------------------------------------------------------------------------

const LEGACY_MAGIC: u8 = b'C';

#[repr(C)]
struct MemAllocReq {
    size: u32,
    cache: u32,
    handle: u32, // out
    name: [u8; NAME_LEN],
}

#[repr(C)]
struct MemHandleReq {
    handle: u32,
}

#[repr(C)]
struct MemResizeReq {
    handle: u32,
    new_size: u32,
}

#[repr(C)]
struct MemShareReq {
    handle: u32,
    new_handle: u32, // out
}

#[repr(C)]
struct MemLockReq {
    handle: u32,
    cache: u32,
    address: u64, // out; 0 = no live mapping
}

#[repr(C)]
struct CacheRangeReq {
    address: u64,
    size: u64,
}

#[repr(C)]
struct MemImportReq {
    fd: i32,
    cache: u32,
    handle: u32, // out
    name: [u8; NAME_LEN],
}

#[repr(C)]
struct MemQueryReq {
    handle: u32,
    size: u32,          // out
    cache: u32,         // out
    map_offset: u64,    // out
    coprocessor_handle: u32, // out
    bus_address: u32,   // out; 0 = unrepresentable
}

#[repr(C)]
struct MapQueryReq {
    pid: u32,
    handle: u32, // in or out depending on direction
    address: u64, // in or out depending on direction
}

/// The Legacy batch form is fixed-size and 32-bit; larger batches are
/// chunked, wider addresses are rejected upstream.
const LEGACY_BATCH_MAX: usize = 8;

#[repr(C)]
#[derive(Clone, Copy)]
struct CacheOp32 {
    op: u32,
    address: u32,
    size: u32,
}

#[repr(C)]
struct CacheBatchReq {
    count: u32,
    ops: [CacheOp32; LEGACY_BATCH_MAX],
}

const LEGACY_ALLOC: libc::c_ulong = iowr::<MemAllocReq>(LEGACY_MAGIC, 0);
const LEGACY_FREE: libc::c_ulong = iow::<MemHandleReq>(LEGACY_MAGIC, 1);
const LEGACY_RESIZE: libc::c_ulong = iow::<MemResizeReq>(LEGACY_MAGIC, 2);
const LEGACY_SHARE: libc::c_ulong = iowr::<MemShareReq>(LEGACY_MAGIC, 3);
const LEGACY_LOCK: libc::c_ulong = iowr::<MemLockReq>(LEGACY_MAGIC, 4);
const LEGACY_LOCK_CACHE: libc::c_ulong = iowr::<MemLockReq>(LEGACY_MAGIC, 5);
const LEGACY_UNLOCK: libc::c_ulong = iow::<MemHandleReq>(LEGACY_MAGIC, 6);
const LEGACY_FLUSH: libc::c_ulong = iow::<CacheRangeReq>(LEGACY_MAGIC, 7);
const LEGACY_INVALIDATE: libc::c_ulong = iow::<CacheRangeReq>(LEGACY_MAGIC, 8);
const LEGACY_IMPORT: libc::c_ulong = iowr::<MemImportReq>(LEGACY_MAGIC, 9);
const LEGACY_QUERY: libc::c_ulong = iowr::<MemQueryReq>(LEGACY_MAGIC, 10);
const LEGACY_ADDR_FROM_HANDLE: libc::c_ulong = iowr::<MapQueryReq>(LEGACY_MAGIC, 11);
const LEGACY_HANDLE_FROM_ADDR: libc::c_ulong = iowr::<MapQueryReq>(LEGACY_MAGIC, 12);
const LEGACY_CLEAN_INVALID: libc::c_ulong = iow::<CacheBatchReq>(LEGACY_MAGIC, 13);

// ---------------------------------------------------------------------------
// Extended wire structs (magic 'E', plus the per-buffer sync ioctl)
// ---------------------------------------------------------------------------

const EXT_MAGIC: u8 = b'E';

#[repr(C)]
struct ExtAllocReq {
    size: u64,               // in: requested; out: actual size as rounded by the driver
    cache: u32,
    fd: i32,                 // out: the allocation's own descriptor
    coprocessor_handle: u32, // out
    _pad: u32,
    bus_address: u64, // out; 0 = unrepresentable
    name: [u8; NAME_LEN],
}

#[repr(C)]
struct ExtImportReq {
    fd: i32,
    cache: u32,
    new_fd: i32,             // out
    coprocessor_handle: u32, // out
    size: u64,               // out
    bus_address: u64,        // out; 0 = unrepresentable
    name: [u8; NAME_LEN],
}

#[repr(C)]
struct ExtCacheOp {
    op: u32,
    _pad: u32,
    address: u64,
    size: u64,
}

#[repr(C)]
struct ExtCacheBatchReq {
    ops: u64, // user pointer to `count` ExtCacheOp entries
    count: u32,
    _pad: u32,
}

const EXT_ALLOC: libc::c_ulong = iowr::<ExtAllocReq>(EXT_MAGIC, 0);
const EXT_IMPORT: libc::c_ulong = iowr::<ExtImportReq>(EXT_MAGIC, 1);
const EXT_CLEAN_INVALID: libc::c_ulong = iow::<ExtCacheBatchReq>(EXT_MAGIC, 2);

/// Begin/end-access sync on the allocation's own descriptor.
#[repr(C)]
struct BufferSyncReq {
    flags: u64,
}

const SYNC_READ: u64 = 1;
const SYNC_WRITE: u64 = 2;
const SYNC_RW: u64 = SYNC_READ | SYNC_WRITE;
const SYNC_START: u64 = 0;
const SYNC_END: u64 = 4;

const BUFFER_SYNC: libc::c_ulong = iow::<BufferSyncReq>(b'b', 0);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Blocking ioctl transport over one of the driver's device nodes.
#[derive(Debug)]
pub struct DeviceTransport {
    fd: OwnedFd,
    backend: Backend,
}

impl DeviceTransport {
    /// Open the control channel, probing device nodes per the backend
    /// preference, or adopting a caller-provided descriptor.
    ///
    /// With `external_fd` the descriptor is duplicated and the backend is
    /// inferred from `want_export` (no probing). Otherwise the preferred
    /// node is tried first and the other is the fallback.
    pub fn open(want_export: bool, external_fd: Option<BorrowedFd<'_>>) -> Result<Self> {
        if let Some(fd) = external_fd {
            let backend = if want_export {
                Backend::Extended
            } else {
                Backend::Legacy
            };
            let fd = fd.try_clone_to_owned()?;
            tracing::debug!(%backend, "adopted external control channel descriptor");
            return Ok(Self { fd, backend });
        }

        let (first, second) = if want_export {
            (
                (EXTENDED_DEVICE, Backend::Extended),
                (LEGACY_DEVICE, Backend::Legacy),
            )
        } else {
            (
                (LEGACY_DEVICE, Backend::Legacy),
                (EXTENDED_DEVICE, Backend::Extended),
            )
        };

        match Self::open_node(first.0) {
            Ok(fd) => Ok(Self {
                fd,
                backend: first.1,
            }),
            Err(first_err) => {
                tracing::debug!(
                    node = first.0,
                    error = %first_err,
                    fallback = second.0,
                    "preferred device node unavailable"
                );
                let fd = Self::open_node(second.0)?;
                Ok(Self {
                    fd,
                    backend: second.1,
                })
            }
        }
    }

    fn open_node(path: &str) -> Result<OwnedFd> {
        Ok(rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CLOEXEC,
            Mode::empty(),
        )?)
    }

    /// The backend this channel is bound to for its lifetime.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn submit_legacy(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        let chan = self.fd.as_fd();
        match request {
            ControlRequest::Allocate { size, mode, name } => {
                let mut req = MemAllocReq {
                    size: wire_u32("allocate", size)?,
                    cache: mode.to_wire(),
                    handle: 0,
                    name: [0; NAME_LEN],
                };
                put_name(&mut req.name, name);
                ioctl_on(chan, "allocate", LEGACY_ALLOC, &mut req)?;
                Ok(ControlResponse::Handle(req.handle))
            }
            ControlRequest::Free { handle } => {
                let mut req = MemHandleReq { handle };
                ioctl_on(chan, "free", LEGACY_FREE, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Resize { handle, new_size } => {
                let mut req = MemResizeReq {
                    handle,
                    new_size: wire_u32("resize", new_size)?,
                };
                ioctl_on(chan, "resize", LEGACY_RESIZE, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Share { handle } => {
                let mut req = MemShareReq {
                    handle,
                    new_handle: 0,
                };
                ioctl_on(chan, "share", LEGACY_SHARE, &mut req)?;
                Ok(ControlResponse::Handle(req.new_handle))
            }
            ControlRequest::Lock { handle } => {
                let mut req = MemLockReq {
                    handle,
                    cache: 0,
                    address: 0,
                };
                ioctl_on(chan, "lock", LEGACY_LOCK, &mut req)?;
                Ok(ControlResponse::Address(address_or_none(req.address)))
            }
            ControlRequest::LockWithCacheMode { handle, mode } => {
                let mut req = MemLockReq {
                    handle,
                    cache: mode.to_wire(),
                    address: 0,
                };
                ioctl_on(chan, "lock_cache", LEGACY_LOCK_CACHE, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Unlock { handle } => {
                let mut req = MemHandleReq { handle };
                ioctl_on(chan, "unlock", LEGACY_UNLOCK, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Flush { address, size } => {
                let mut req = CacheRangeReq {
                    address: address as u64,
                    size: size as u64,
                };
                ioctl_on(chan, "flush", LEGACY_FLUSH, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Invalidate { address, size } => {
                let mut req = CacheRangeReq {
                    address: address as u64,
                    size: size as u64,
                };
                ioctl_on(chan, "invalidate", LEGACY_INVALIDATE, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::Import { fd, mode, name } => {
                let mut req = MemImportReq {
                    fd: fd.as_raw_fd(),
                    cache: mode.to_wire(),
                    handle: 0,
                    name: [0; NAME_LEN],
                };
                put_name(&mut req.name, name);
                ioctl_on(chan, "import", LEGACY_IMPORT, &mut req)?;
                Ok(ControlResponse::Handle(req.handle))
            }
            ControlRequest::QuerySize { handle } => {
                let req = self.query(handle)?;
                Ok(ControlResponse::Size(req.size as usize))
            }
            ControlRequest::QueryCacheState { handle } => {
                let req = self.query(handle)?;
                let mode = CacheMode::from_wire(req.cache)
                    .ok_or_else(|| Error::kernel("query_cache_state", rustix::io::Errno::PROTO))?;
                Ok(ControlResponse::CacheState(mode))
            }
            ControlRequest::QueryMapOffset { handle } => {
                let req = self.query(handle)?;
                Ok(ControlResponse::MapOffset(req.map_offset))
            }
            ControlRequest::QueryCoprocessorHandle { handle } => {
                let req = self.query(handle)?;
                Ok(ControlResponse::CoprocessorHandle(req.coprocessor_handle))
            }
            ControlRequest::QueryBusAddress { handle } => {
                let req = self.query(handle)?;
                let bus = (req.bus_address != 0).then_some(req.bus_address);
                Ok(ControlResponse::BusAddress(bus))
            }
            ControlRequest::MapAddressFromHandle { pid, handle } => {
                let mut req = MapQueryReq {
                    pid,
                    handle,
                    address: 0,
                };
                ioctl_on(chan, "map_address_from_handle", LEGACY_ADDR_FROM_HANDLE, &mut req)?;
                Ok(ControlResponse::Address(address_or_none(req.address)))
            }
            ControlRequest::MapHandleFromAddress { pid, address } => {
                let mut req = MapQueryReq {
                    pid,
                    handle: 0,
                    address: address as u64,
                };
                ioctl_on(chan, "map_handle_from_address", LEGACY_HANDLE_FROM_ADDR, &mut req)?;
                Ok(ControlResponse::Handle(req.handle))
            }
            ControlRequest::CleanInvalid { ops } => {
                self.legacy_clean_invalid(ops)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::BeginAccess { .. } | ControlRequest::EndAccess { .. } => Err(
                Error::InvalidArgument("descriptor sync is not in the Legacy vocabulary".into()),
            ),
        }
    }

    fn query(&self, handle: crate::Handle) -> Result<MemQueryReq> {
        let mut req = MemQueryReq {
            handle,
            size: 0,
            cache: 0,
            map_offset: 0,
            coprocessor_handle: 0,
            bus_address: 0,
        };
        ioctl_on(self.fd.as_fd(), "query", LEGACY_QUERY, &mut req)?;
        Ok(req)
    }

    /// The fixed-size Legacy batch form: chunked, 32-bit only. Callers have
    /// already rejected wider addresses; this is the last line of defense.
    fn legacy_clean_invalid(&self, ops: &[CacheOp]) -> Result<()> {
        for chunk in ops.chunks(LEGACY_BATCH_MAX) {
            let mut req = CacheBatchReq {
                count: chunk.len() as u32,
                ops: [CacheOp32 {
                    op: 0,
                    address: 0,
                    size: 0,
                }; LEGACY_BATCH_MAX],
            };
            for (slot, op) in req.ops.iter_mut().zip(chunk) {
                slot.op = op.op.to_wire();
                slot.address = wire_u32("clean_invalid", op.address)?;
                slot.size = wire_u32("clean_invalid", op.size)?;
            }
            ioctl_on(self.fd.as_fd(), "clean_invalid", LEGACY_CLEAN_INVALID, &mut req)?;
        }
        Ok(())
    }

    fn submit_extended(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        let chan = self.fd.as_fd();
        match request {
            ControlRequest::Allocate { size, mode, name } => {
                let mut req = ExtAllocReq {
                    size: size as u64,
                    cache: mode.to_wire(),
                    fd: -1,
                    coprocessor_handle: 0,
                    _pad: 0,
                    bus_address: 0,
                    name: [0; NAME_LEN],
                };
                put_name(&mut req.name, name);
                ioctl_on(chan, "allocate", EXT_ALLOC, &mut req)?;
                // SAFETY: on success the driver returned a fresh descriptor
                // owned by this process.
                let descriptor = unsafe { OwnedFd::from_raw_fd(req.fd) };
                Ok(descriptor_response(
                    descriptor,
                    req.coprocessor_handle,
                    req.bus_address,
                    req.size,
                ))
            }
            ControlRequest::Import { fd, mode, name } => {
                let mut req = ExtImportReq {
                    fd: fd.as_raw_fd(),
                    cache: mode.to_wire(),
                    new_fd: -1,
                    coprocessor_handle: 0,
                    size: 0,
                    bus_address: 0,
                    name: [0; NAME_LEN],
                };
                put_name(&mut req.name, name);
                ioctl_on(chan, "import", EXT_IMPORT, &mut req)?;
                // SAFETY: on success the driver returned a fresh descriptor
                // owned by this process.
                let descriptor = unsafe { OwnedFd::from_raw_fd(req.new_fd) };
                Ok(descriptor_response(
                    descriptor,
                    req.coprocessor_handle,
                    req.bus_address,
                    req.size,
                ))
            }
            ControlRequest::CleanInvalid { ops } => {
                // The batch buffer is heap-allocated, sized to the batch,
                // and released whether or not the ioctl succeeds.
                let wire: Vec<ExtCacheOp> = ops
                    .iter()
                    .map(|op| ExtCacheOp {
                        op: op.op.to_wire(),
                        _pad: 0,
                        address: op.address as u64,
                        size: op.size as u64,
                    })
                    .collect();
                let mut req = ExtCacheBatchReq {
                    ops: wire.as_ptr() as u64,
                    count: wire.len() as u32,
                    _pad: 0,
                };
                let result = ioctl_on(chan, "clean_invalid", EXT_CLEAN_INVALID, &mut req);
                drop(wire);
                result?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::BeginAccess { descriptor } => {
                let mut req = BufferSyncReq {
                    flags: SYNC_START | SYNC_RW,
                };
                ioctl_on(descriptor, "begin_access", BUFFER_SYNC, &mut req)?;
                Ok(ControlResponse::Done)
            }
            ControlRequest::EndAccess { descriptor, flush } => {
                // A no-flush end still closes the window, read-only.
                let access = if flush { SYNC_RW } else { SYNC_READ };
                let mut req = BufferSyncReq {
                    flags: SYNC_END | access,
                };
                ioctl_on(descriptor, "end_access", BUFFER_SYNC, &mut req)?;
                Ok(ControlResponse::Done)
            }
            other => Err(Error::InvalidArgument(format!(
                "request {other:?} is not in the Extended vocabulary"
            ))),
        }
    }
}

fn address_or_none(raw: u64) -> Option<usize> {
    (raw != 0).then_some(raw as usize)
}

/// Assemble the Extended allocate/import response from the driver's
/// out-fields. `size` is whatever the driver reported back, not what the
/// caller asked for; the two differ when the driver rounds differently
/// than the host page size.
fn descriptor_response(
    descriptor: OwnedFd,
    coprocessor_handle: u32,
    bus_address: u64,
    size: u64,
) -> ControlResponse {
    ControlResponse::Descriptor {
        descriptor,
        coprocessor_handle,
        bus_address: narrow_bus_address(bus_address),
        size: size as usize,
    }
}

/// Narrow a driver-reported bus address to the coprocessor's 32-bit space.
/// An address that does not fit is a defect and is reported as absent,
/// never truncated.
fn narrow_bus_address(raw: u64) -> Option<u32> {
    if raw == 0 {
        return None;
    }
    match u32::try_from(raw) {
        Ok(narrow) => Some(narrow),
        Err(_) => {
            tracing::error!(
                bus_address = raw,
                "bus address exceeds the coprocessor's 32-bit space; reporting absent"
            );
            None
        }
    }
}

fn wire_u32(op: &'static str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::InvalidArgument(format!(
            "`{op}`: value {value:#x} does not fit the Legacy 32-bit wire form"
        ))
    })
}

impl ControlTransport for DeviceTransport {
    fn submit(&self, request: ControlRequest<'_>) -> Result<ControlResponse> {
        match self.backend {
            Backend::Legacy => self.submit_legacy(request),
            Backend::Extended => self.submit_extended(request),
        }
    }

    fn channel_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_are_distinct() {
        let numbers = [
            LEGACY_ALLOC,
            LEGACY_FREE,
            LEGACY_RESIZE,
            LEGACY_SHARE,
            LEGACY_LOCK,
            LEGACY_LOCK_CACHE,
            LEGACY_UNLOCK,
            LEGACY_FLUSH,
            LEGACY_INVALIDATE,
            LEGACY_IMPORT,
            LEGACY_QUERY,
            LEGACY_ADDR_FROM_HANDLE,
            LEGACY_HANDLE_FROM_ADDR,
            LEGACY_CLEAN_INVALID,
            EXT_ALLOC,
            EXT_IMPORT,
            EXT_CLEAN_INVALID,
            BUFFER_SYNC,
        ];
        let unique: std::collections::HashSet<_> = numbers.iter().collect();
        assert_eq!(unique.len(), numbers.len());
    }

    #[test]
    fn test_narrow_bus_address() {
        assert_eq!(narrow_bus_address(0), None);
        assert_eq!(narrow_bus_address(0xC000_0000), Some(0xC000_0000));
        assert_eq!(narrow_bus_address(0x1_0000_0000), None);
    }

    #[test]
    fn test_wire_u32_rejects_wide_values() {
        assert_eq!(wire_u32("clean_invalid", 4096).unwrap(), 4096);
        assert!(wire_u32("clean_invalid", u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_descriptor_response_reports_driver_size() {
        let fd =
            rustix::fs::memfd_create("driver-rounded", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        // The caller asked for 5000 bytes; the driver rounded to 8192 and
        // wrote that back into the request's size field.
        match descriptor_response(fd, 0x200, 0xC000_0000, 8192) {
            ControlResponse::Descriptor {
                size, bus_address, ..
            } => {
                assert_eq!(size, 8192);
                assert_eq!(bus_address, Some(0xC000_0000));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_name_truncation() {
        let mut field = [0u8; NAME_LEN];
        put_name(&mut field, "a-name-well-beyond-thirty-two-bytes-long");
        assert_eq!(field[NAME_LEN - 1], 0);
        assert_eq!(&field[..4], b"a-na");
    }
}
