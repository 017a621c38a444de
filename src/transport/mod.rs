//! Control-channel transports.
//!
//! Two implementations of [`crate::request::ControlTransport`] live here:
//!
//! - [`device::DeviceTransport`]: the real thing, lowering every request to
//!   an ioctl on the kernel driver's device node.
//! - [`mock::MockTransport`]: an in-process implementation of the same
//!   vocabulary over memfds, for tests and for running without the driver.

pub mod device;
pub mod mock;
