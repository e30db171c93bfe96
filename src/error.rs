//! Error taxonomy shared by sessions, streams and mapped buffers.

use std::io;

use nix::libc;

/// Errors surfaced synchronously from the call that caused them.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    /// The device node is already held open by someone else.
    #[error("device is busy")]
    DeviceBusy,
    /// The device node does not exist or could not be reached.
    #[error("device is unavailable")]
    DeviceUnavailable,
    /// The format (or sharing mode) cannot be negotiated as requested.
    #[error("format not supported: {0}")]
    FormatUnsupported(String),
    /// Close attempted while buffers are still queued.
    #[error("stream still has queued buffers")]
    StillActive,
    /// The handle was closed, never opened, or refers to an unknown device.
    #[error("invalid handle")]
    InvalidHandle,
    /// Allocation of a queue, scratch buffer or mapping failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The backend cannot stop or resume this buffer without a full reopen.
    #[error("buffer must be recreated")]
    MustRecreate,
    /// Operation not available on this backend or in this buffer mode.
    #[error("operation unsupported")]
    Unsupported,
    /// Unexpected device-control failure.
    #[error("device i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Classify an error returned by opening a device node.
    pub(crate) fn from_open(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBUSY) => DriverError::DeviceBusy,
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                DriverError::DeviceUnavailable
            }
            Some(libc::ENOMEM) => DriverError::OutOfMemory,
            _ => DriverError::Io(err),
        }
    }
}

/// True when an ioctl was rejected as an invalid argument.
pub(crate) fn is_invalid_argument(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINVAL)
}
