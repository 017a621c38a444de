//! Error types for coshm.

use thiserror::Error;

use crate::backend::Backend;

/// Result type alias using coshm's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for coshm operations.
///
/// `free` and `unlock` never surface these to the caller: release failures
/// are logged and swallowed because the kernel driver reclaims everything
/// when the control channel closes. Every acquire-style operation
/// (`allocate`, `lock`, `resize`, `import_external`, ...) propagates.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was invalid (zero size, zero handle,
    /// operation/backend mismatch detected before reaching the kernel).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fixed-capacity resource ran out (allocation arena full, or the
    /// control channel is not open).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A control request reached the kernel driver and failed there.
    /// The original status code is preserved for diagnostics.
    #[error("kernel request `{op}` failed: {errno}")]
    KernelRequestFailed {
        /// Which request failed.
        op: &'static str,
        /// The status the driver returned.
        errno: rustix::io::Errno,
    },

    /// The operation exists but is a documented gap on the active backend
    /// (`share`/`resize`/`lock_cache` on Extended, `export` on Legacy).
    #[error("`{op}` is not supported on the {backend} backend")]
    UnsupportedOnBackend {
        /// The unsupported operation.
        op: &'static str,
        /// The backend the channel is bound to.
        backend: Backend,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Build a [`Error::KernelRequestFailed`] preserving the driver status.
    pub(crate) fn kernel(op: &'static str, errno: rustix::io::Errno) -> Self {
        Error::KernelRequestFailed { op, errno }
    }
}
