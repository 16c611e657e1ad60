//! The USB monitor: hooks hub bus drivers' PnP dispatch, rewrites device
//! identification answers for filtered devices so the capture driver
//! loads for them, and tracks captured devices via the inter-driver
//! channel with the proxy.

pub mod filter;
pub mod hook;
pub mod ioctl;

mod monitor;

pub use monitor::{MonCtx, Monitor};
