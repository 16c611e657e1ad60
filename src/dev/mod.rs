//! The capture device driver: its PnP state machine and the runtime
//! surface user-mode clients drive once a device is captured.

pub mod pnp;
pub mod rt;

pub use pnp::{DdiState, PnpState, UsbDev};
