//! End-to-end allocator tests over the mock transport: real mappings and
//! descriptors, simulated kernel, counted cache maintenance.

use std::sync::Arc;

use coshm::transport::mock::MockTransport;
use coshm::{Backend, CacheMode, CacheOp, Error, MaintOp, Shm};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn legacy_service() -> (Arc<MockTransport>, Arc<Shm>) {
    init_logging();
    let mock = Arc::new(MockTransport::legacy().unwrap());
    let shm = Shm::with_transport(mock.clone(), Backend::Legacy);
    (mock, shm)
}

fn extended_service() -> (Arc<MockTransport>, Arc<Shm>) {
    init_logging();
    let mock = Arc::new(MockTransport::extended().unwrap());
    let shm = Shm::with_transport(mock.clone(), Backend::Extended);
    (mock, shm)
}

/// Fill the locked buffer with `byte` through the guard pointer.
fn fill(guard: &coshm::AccessGuard, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(guard.as_ptr(), byte, len) }
}

fn read_at(guard: &coshm::AccessGuard, index: usize) -> u8 {
    unsafe { *guard.as_ptr().add(index) }
}

#[test]
fn test_sixteen_host_cached_buffers() {
    let (mock, shm) = legacy_service();
    let page = shm.page_size();

    let mut handles = Vec::new();
    for i in 0..16 {
        let h = shm
            .allocate(4096, CacheMode::Host, &format!("buf-{i}"))
            .unwrap();
        handles.push(h);
    }
    assert_eq!(mock.live_buffers(), 16);

    // Every buffer gets its own page-aligned mapping, written and read
    // back inside a lock/unlock bracket.
    for (i, &h) in handles.iter().enumerate() {
        let guard = shm.lock(h).unwrap();
        assert_eq!(guard.as_ptr() as usize % page, 0);
        fill(&guard, 4096, i as u8);
        assert_eq!(read_at(&guard, 4095), i as u8);
        guard.unlock(false);
    }

    for &h in &handles {
        shm.free(h);
    }
    assert_eq!(mock.live_buffers(), 0);
}

#[test]
fn test_address_handle_translation_round_trips() {
    for (_, shm) in [legacy_service(), extended_service()] {
        let h = shm.allocate(8192, CacheMode::Host, "xlate").unwrap();
        let base = shm.address_of(h).unwrap() as usize;

        assert_eq!(shm.handle_of(base), Some(h));
        // Interior addresses resolve to the same handle.
        assert_eq!(shm.handle_of(base + 4097), Some(h));
        // One past the end does not.
        assert_eq!(shm.handle_of(base + 8192), None);

        shm.free(h);
        assert_eq!(shm.address_of(h), None);
    }
}

#[test]
fn test_lock_invalidates_and_unlock_flushes() {
    let (mock, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::Host, "bracket").unwrap();

    let invalidates = mock.invalidate_count();
    let flushes = mock.flush_count();

    let guard = shm.lock(h).unwrap();
    assert_eq!(mock.invalidate_count(), invalidates + 1);

    guard.unlock(false);
    assert_eq!(mock.flush_count(), flushes + 1);

    // Read-only window: the flush is skipped on request.
    let guard = shm.lock(h).unwrap();
    guard.unlock(true);
    assert_eq!(mock.flush_count(), flushes + 1);

    shm.free(h);
}

#[test]
fn test_guard_drop_ends_the_window_with_flush() {
    let (mock, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::Host, "drop").unwrap();

    let flushes = mock.flush_count();
    {
        let _guard = shm.lock(h).unwrap();
    }
    assert_eq!(mock.flush_count(), flushes + 1);

    shm.free(h);
}

#[test]
fn test_extended_access_window_syncs() {
    let (mock, shm) = extended_service();
    let h = shm.allocate(4096, CacheMode::Host, "sync").unwrap();

    let guard = shm.lock(h).unwrap();
    assert_eq!(mock.begin_access_count(), 1);
    fill(&guard, 4096, 0xAB);
    guard.unlock(false);
    assert_eq!(mock.end_access_flush_count(), 1);

    let guard = shm.lock(h).unwrap();
    assert_eq!(read_at(&guard, 100), 0xAB);
    guard.unlock(true);
    assert_eq!(mock.end_access_skip_count(), 1);

    shm.free(h);
}

#[test]
fn test_cache_transition_table() {
    use CacheMode::{Coprocessor, Host, HostAndCoprocessor, None as Uncached};

    // (current, requested, resulting): asymmetric on purpose.
    let table = [
        (Uncached, Host, Host),
        (Uncached, Coprocessor, Uncached),
        (Uncached, HostAndCoprocessor, Host),
        (Host, Uncached, Uncached),
        (Host, Coprocessor, Host),
        (Host, HostAndCoprocessor, Host),
        (Coprocessor, Uncached, Uncached),
        (Coprocessor, Host, HostAndCoprocessor),
        (Coprocessor, HostAndCoprocessor, HostAndCoprocessor),
        (HostAndCoprocessor, Uncached, Coprocessor),
        (HostAndCoprocessor, Host, HostAndCoprocessor),
        (HostAndCoprocessor, Coprocessor, Coprocessor),
    ];

    let (_, shm) = legacy_service();
    for (current, requested, resulting) in table {
        let h = shm.allocate(4096, current, "transition").unwrap();
        let guard = shm.lock_cache(h, requested).unwrap();
        assert_eq!(
            guard.cache_mode(),
            Some(resulting),
            "{current} + requested {requested}"
        );
        guard.unlock(false);

        // The mode stuck: asking again for the same thing reports the
        // resulting mode computed from the *new* state.
        let guard = shm.lock_cache(h, resulting).unwrap();
        assert_eq!(guard.cache_mode(), Some(resulting));
        guard.unlock(false);

        shm.free(h);
    }
}

#[test]
fn test_transition_is_not_symmetric() {
    use CacheMode::{Coprocessor, HostAndCoprocessor, None as Uncached};
    let (_, shm) = legacy_service();

    // Fully-cached buffer asked to drop to uncached keeps the
    // coprocessor side.
    let h = shm
        .allocate(4096, HostAndCoprocessor, "asym")
        .unwrap();
    let guard = shm.lock_cache(h, Uncached).unwrap();
    assert_eq!(guard.cache_mode(), Some(Coprocessor));
    guard.unlock(false);
    shm.free(h);

    // The mirror image from uncached stays uncached.
    let h = shm.allocate(4096, Uncached, "asym-mirror").unwrap();
    let guard = shm.lock_cache(h, Coprocessor).unwrap();
    assert_eq!(guard.cache_mode(), Some(Uncached));
    guard.unlock(false);
    shm.free(h);
}

#[test]
fn test_uncached_buffer_requesting_full_caching_gets_host_only() {
    let (_, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::None, "warmup").unwrap();

    let guard = shm.lock_cache(h, CacheMode::HostAndCoprocessor).unwrap();
    assert_eq!(guard.cache_mode(), Some(CacheMode::Host));
    guard.unlock(false);

    shm.free(h);
}

#[test]
fn test_lock_cache_same_mode_is_a_plain_lock() {
    let (mock, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::Host, "idem").unwrap();
    let base = shm.address_of(h).unwrap();

    let guard = shm.lock_cache(h, CacheMode::Host).unwrap();
    assert_eq!(guard.cache_mode(), Some(CacheMode::Host));
    // No remap happened.
    assert_eq!(guard.as_ptr(), base);
    guard.unlock(false);

    assert_eq!(mock.live_buffers(), 1);
    shm.free(h);
}

#[test]
fn test_extended_lock_cache_cannot_move_the_mode() {
    let (_, shm) = extended_service();
    let h = shm.allocate(4096, CacheMode::Coprocessor, "fixed").unwrap();

    // Same mode, and requests the table says have no net effect, behave
    // like a plain lock.
    let guard = shm.lock_cache(h, CacheMode::Coprocessor).unwrap();
    assert_eq!(guard.cache_mode(), Some(CacheMode::Coprocessor));
    guard.unlock(false);

    // A request that would actually change the mode is refused.
    let err = shm.lock_cache(h, CacheMode::Host).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedOnBackend {
            op: "lock_cache",
            backend: Backend::Extended,
        }
    ));

    shm.free(h);
}

#[test]
fn test_arena_exhaustion_and_slot_reuse() {
    let mock = Arc::new(MockTransport::extended().unwrap());
    let shm = Shm::with_transport_capacity(mock.clone(), Backend::Extended, 2);

    let a = shm.allocate(4096, CacheMode::Host, "a").unwrap();
    let b = shm.allocate(4096, CacheMode::Host, "b").unwrap();
    assert_eq!(shm.arena_occupancy(), Some(2));

    let err = shm.allocate(4096, CacheMode::Host, "c").unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    // The failed allocation leaked nothing.
    assert_eq!(shm.arena_occupancy(), Some(2));

    shm.free(a);
    assert_eq!(shm.arena_occupancy(), Some(1));
    let c = shm.allocate(4096, CacheMode::Host, "c").unwrap();
    assert_ne!(c, b);

    shm.free(b);
    shm.free(c);
    assert_eq!(shm.arena_occupancy(), Some(0));
}

#[test]
fn test_stale_handles_are_detected() {
    let (_, shm) = extended_service();
    let h = shm.allocate(4096, CacheMode::Host, "stale").unwrap();
    shm.free(h);

    // Double free is a detected no-op.
    shm.free(h);
    // A stale handle never resolves, even after the slot is reused.
    let again = shm.allocate(4096, CacheMode::Host, "reuse").unwrap();
    assert_ne!(again, h);
    assert!(shm.lock(h).is_err());
    assert_eq!(shm.address_of(h), None);

    shm.free(again);
}

#[test]
fn test_legacy_free_of_unknown_handle_does_not_panic() {
    let (mock, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::Host, "once").unwrap();
    shm.free(h);
    shm.free(h);
    shm.free(0);
    assert_eq!(mock.live_buffers(), 0);
}

#[test]
fn test_legacy_resize() {
    let (_, shm) = legacy_service();
    let page = shm.page_size();
    let h = shm.allocate(4096, CacheMode::Host, "grow").unwrap();

    let guard = shm.lock(h).unwrap();
    fill(&guard, 4096, 0x5A);
    guard.unlock(false);

    shm.resize(h, 3 * page).unwrap();
    let guard = shm.lock(h).unwrap();
    // The old contents survive an in-place grow.
    assert_eq!(read_at(&guard, 4095), 0x5A);
    fill(&guard, 3 * page, 0x77);
    guard.unlock(false);

    shm.free(h);
}

#[test]
fn test_legacy_resize_failure_keeps_the_buffer_usable() {
    let (_, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::Host, "immovable").unwrap();

    let guard = shm.lock(h).unwrap();
    fill(&guard, 4096, 0x11);
    guard.unlock(false);

    // The mock's window cannot grow to 64 MiB; the resize is refused
    // all-or-nothing.
    let err = shm.resize(h, 64 << 20).unwrap_err();
    assert!(matches!(err, Error::KernelRequestFailed { .. }));

    // Original size, mapping and contents are intact.
    let guard = shm.lock(h).unwrap();
    assert_eq!(read_at(&guard, 0), 0x11);
    guard.unlock(true);

    shm.free(h);
}

#[test]
fn test_share_aliases_the_same_memory() {
    let (mock, shm) = legacy_service();
    let h1 = shm.allocate(4096, CacheMode::Host, "orig").unwrap();
    let h2 = shm.share(h1).unwrap();
    assert_ne!(h1, h2);
    assert_eq!(mock.live_buffers(), 2);

    let guard = shm.lock(h1).unwrap();
    fill(&guard, 4096, 0xEE);
    guard.unlock(false);

    // Writes through one handle are visible through the other.
    let guard = shm.lock(h2).unwrap();
    assert_eq!(read_at(&guard, 1234), 0xEE);
    guard.unlock(true);

    // Each handle is freed independently.
    shm.free(h1);
    assert_eq!(mock.live_buffers(), 1);
    let guard = shm.lock(h2).unwrap();
    assert_eq!(read_at(&guard, 1234), 0xEE);
    guard.unlock(true);
    shm.free(h2);
    assert_eq!(mock.live_buffers(), 0);
}

#[test]
fn test_share_is_legacy_only() {
    let (_, shm) = extended_service();
    let h = shm.allocate(4096, CacheMode::Host, "noshare").unwrap();

    assert!(matches!(
        shm.share(h).unwrap_err(),
        Error::UnsupportedOnBackend { op: "share", .. }
    ));
    assert!(matches!(
        shm.resize(h, 8192).unwrap_err(),
        Error::UnsupportedOnBackend { op: "resize", .. }
    ));

    shm.free(h);
}

#[test]
fn test_export_is_extended_only() {
    let (_, shm) = legacy_service();
    let h = shm.allocate(4096, CacheMode::Host, "noexport").unwrap();
    assert!(matches!(
        shm.export_external(h).unwrap_err(),
        Error::UnsupportedOnBackend {
            op: "export_external",
            ..
        }
    ));
    shm.free(h);
}

#[test]
fn test_extended_export_outlives_the_handle() {
    let (_, shm) = extended_service();
    let h = shm.allocate(8192, CacheMode::Host, "export").unwrap();

    let guard = shm.lock(h).unwrap();
    fill(&guard, 8192, 0xC3);
    guard.unlock(false);

    let exported = shm.export_external(h).unwrap();
    shm.free(h);

    // The exported descriptor still reaches the memory after the handle
    // is gone.
    let stat = rustix::fs::fstat(&exported).unwrap();
    assert_eq!(stat.st_size, 8192);
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            8192,
            rustix::mm::ProtFlags::READ,
            rustix::mm::MapFlags::SHARED,
            &exported,
            0,
        )
        .unwrap()
    };
    let seen = unsafe { *ptr.cast::<u8>() };
    assert_eq!(seen, 0xC3);
    unsafe { rustix::mm::munmap(ptr, 8192).unwrap() };
}

#[test]
fn test_import_external_memory() {
    for (_, shm) in [legacy_service(), extended_service()] {
        let fd = rustix::fs::memfd_create("external", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, 8192).unwrap();
        rustix::io::pwrite(&fd, &[0x5A; 16], 0).unwrap();

        let h = shm.import_external(fd, "imported").unwrap();
        let guard = shm.lock(h).unwrap();
        // The external memory's existing contents are visible through the
        // imported handle.
        assert_eq!(read_at(&guard, 0), 0x5A);
        assert_eq!(read_at(&guard, 15), 0x5A);
        fill(&guard, 8192, 0x42);
        assert_eq!(read_at(&guard, 8191), 0x42);
        guard.unlock(false);

        let base = shm.address_of(h).unwrap() as usize;
        assert_eq!(shm.handle_of(base), Some(h));
        shm.free(h);
    }
}

#[test]
fn test_coprocessor_identity() {
    for (_, shm) in [legacy_service(), extended_service()] {
        let a = shm.allocate(4096, CacheMode::Host, "ident-a").unwrap();
        let b = shm.allocate(4096, CacheMode::Host, "ident-b").unwrap();

        let ca = shm.coprocessor_handle_of(a).unwrap();
        let cb = shm.coprocessor_handle_of(b).unwrap();
        assert_ne!(ca, 0);
        assert_ne!(ca, cb);

        // The mock's bus window has room for small buffers.
        assert!(shm.coprocessor_bus_address_of(a).unwrap().is_some());

        shm.free(a);
        shm.free(b);
    }
}

#[test]
fn test_clean_invalid_batches() {
    // The Extended wire form is 64-bit, so real mapped addresses go
    // through as-is.
    let (mock, shm) = extended_service();
    let h = shm.allocate(8192, CacheMode::Host, "batch").unwrap();
    let base = shm.address_of(h).unwrap() as usize;

    let ops = [
        CacheOp {
            op: MaintOp::Clean,
            address: base,
            size: 4096,
        },
        CacheOp {
            op: MaintOp::Invalidate,
            address: base + 4096,
            size: 4096,
        },
        CacheOp {
            op: MaintOp::CleanInvalidate,
            address: base,
            size: 8192,
        },
    ];
    shm.clean_invalid(&ops).unwrap();
    assert_eq!(mock.clean_invalid_op_count(), 3);

    // An empty batch is a no-op, not a request.
    shm.clean_invalid(&[]).unwrap();
    assert_eq!(mock.clean_invalid_op_count(), 3);

    shm.free(h);
}

#[test]
fn test_clean_invalid_legacy_accepts_ranges_within_32_bits() {
    let (mock, shm) = legacy_service();

    // Addresses below 4 GiB fit the Legacy wire form and go through.
    let ops = [
        CacheOp {
            op: MaintOp::Clean,
            address: 0x1000_0000,
            size: 4096,
        },
        CacheOp {
            op: MaintOp::Invalidate,
            address: 0x1000_1000,
            size: 4096,
        },
    ];
    shm.clean_invalid(&ops).unwrap();
    assert_eq!(mock.clean_invalid_op_count(), 2);

    // A range ending exactly at the 32-bit ceiling is still in bounds.
    shm.clean_invalid(&[CacheOp {
        op: MaintOp::CleanInvalidate,
        address: u32::MAX as usize - 4095,
        size: 4096,
    }])
    .unwrap();
    assert_eq!(mock.clean_invalid_op_count(), 3);
}

#[test]
fn test_clean_invalid_legacy_rejects_ranges_past_32_bits() {
    let (_, shm) = legacy_service();
    let err = shm
        .clean_invalid(&[CacheOp {
            op: MaintOp::Clean,
            address: 1 << 33,
            size: 4096,
        }])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_rejects_degenerate_arguments() {
    let (_, shm) = legacy_service();
    assert!(matches!(
        shm.allocate(0, CacheMode::Host, "empty").unwrap_err(),
        Error::InvalidArgument(_)
    ));

    let h = shm.allocate(4096, CacheMode::Host, "shrinkless").unwrap();
    assert!(matches!(
        shm.resize(h, 0).unwrap_err(),
        Error::InvalidArgument(_)
    ));
    shm.free(h);
}

#[test]
fn test_sizes_round_up_to_pages() {
    let (_, shm) = extended_service();
    let page = shm.page_size();

    let h = shm.allocate(1, CacheMode::Host, "tiny").unwrap();
    let base = shm.address_of(h).unwrap() as usize;
    // The whole rounded page belongs to the allocation.
    assert_eq!(shm.handle_of(base + page - 1), Some(h));
    assert_eq!(shm.handle_of(base + page), None);
    shm.free(h);
}
