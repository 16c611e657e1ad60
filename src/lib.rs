//! Platform-agnostic core of a hypervisor integration layer's USB device
//! capture monitor and command-queue subsystem.
//!
//! The crate implements the state machines, allocators and concurrency
//! control; everything OS-specific (event objects, bus drivers, request
//! delivery) is reached through the traits in [`platform`] and [`bus`].

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod bus;
pub mod cmdq;
pub mod dev;
pub mod mon;
pub mod platform;
pub mod status;
pub mod sync;

pub use cmdq::htable::{HTable, HTableHandle};
pub use cmdq::session::{CmCtx, CmdQueueMgr};
pub use mon::Monitor;
pub use platform::PlatformOps;
pub use status::{Error, Result};

#[cfg(test)]
pub(crate) mod test_support;
