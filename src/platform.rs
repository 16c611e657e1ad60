//! Platform collaborator traits.
//!
//! The embedding driver provides these at attach time; the core never
//! reaches for OS primitives directly. Unlike a process-global service
//! registry, the ops object is owned by the explicit context objects
//! ([`crate::CmdQueueMgr`], [`crate::Monitor`]) and passed along from
//! there.

use alloc::sync::Arc;

use crate::status::Result;

/// An opaque handle to an OS event object as supplied by a user-mode
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// A referenced notification event. Signaling is the only operation the
/// core needs; consumers wait on the underlying object by other means.
pub trait Event: Send + Sync {
    fn signal(&self);
}

/// A private waitable primitive used by the synchronous completion
/// discipline. Created, waited on and dropped by a single logical caller.
pub trait WaitEvent: Send + Sync {
    fn signal(&self);

    /// Blocks until signaled.
    fn wait(&self);

    /// Blocks until signaled or `ms` elapsed. Returns `false` on timeout.
    fn wait_timeout(&self, ms: u32) -> bool;
}

/// A set of platform specific API to be provided by the embedding driver.
pub trait PlatformOps: Send + Sync {
    /// Resolves a caller-supplied event handle into a referenced event
    /// object. Two calls with the same live handle must return references
    /// to the same underlying object. The reference failure is propagated
    /// to the caller unchanged.
    fn reference_event(&self, handle: EventHandle) -> Result<Arc<dyn Event>>;

    /// Creates a private wait primitive for a synchronous submission.
    fn create_wait_event(&self) -> Arc<dyn WaitEvent>;

    /// Sleeps the current thread. Only ever called at passive level.
    fn sleep_ms(&self, ms: u32);
}

/// Identity of a referenced event object, used to key sessions.
pub(crate) fn event_identity(event: &Arc<dyn Event>) -> usize {
    Arc::as_ptr(event).cast::<()>() as usize
}
