//! Result and error taxonomy shared by every subsystem.

/// Typed failure returned to callers of the monitor, the command queue and
/// the device runtime.
///
/// Transfer-level hardware errors (stall, CRC, ...) are deliberately not
/// represented here; a transfer that the device failed still *completes*
/// from the driver's point of view and carries an [`XferError`] as data.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("out of resources")]
    OutOfResources,

    #[error("access denied")]
    AccessDenied,

    #[error("operation not supported")]
    NotSupported,

    #[error("operation invalid for the current device state")]
    InvalidDeviceState,

    #[error("the object is being deleted")]
    DeletePending,

    #[error("outstanding requests have not drained")]
    Busy,

    #[error("the request timed out")]
    TimedOut,

    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
}

pub type Result<T> = core::result::Result<T, Error>;

/// Per-transfer completion code reported by the device, surfaced through
/// the async completion path as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum XferError {
    /// The transfer completed successfully.
    Ok,
    /// The endpoint is stalled.
    Stall,
    /// The device did not respond.
    NoResponse,
    /// CRC error on the wire.
    Crc,
    /// Short read without the short-ok flag.
    Underrun,
    /// The transfer was cancelled before the device completed it.
    Cancelled,
}
