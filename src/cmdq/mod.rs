//! The command queue subsystem: refcounted command buffers multiplexed
//! onto per-client sessions, the two-phase async completion engine, and
//! the supporting allocators (handle table, linked list arena).

pub mod cmd;
pub mod completion;
pub mod htable;
pub mod list;
pub mod session;
