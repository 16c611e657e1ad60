//! A waitable quiesce counter.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::platform::PlatformOps;

const WAIT_STEP_MS: u32 = 2;
const WAIT_MAX_LOOPS: u32 = 256;

/// Counts operations in flight against an object so that teardown can
/// drain them to a known floor before proceeding.
///
/// The counter starts at 1: the owner itself holds the initial reference,
/// so a floor of 1 means "no operation other than the caller is in
/// flight" and a floor of 0 means "even the owner's reference is gone".
#[derive(Debug)]
pub struct QuiesceRef {
    refs: AtomicU32,
}

impl QuiesceRef {
    pub const fn new() -> Self {
        Self {
            refs: AtomicU32::new(1),
        }
    }

    pub fn retain(&self) -> u32 {
        let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(refs < u32::MAX / 2);
        refs
    }

    pub fn release(&self) -> u32 {
        let refs = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(refs != 0);
        refs - 1
    }

    pub fn count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Waits until the count drains to `floor` or the bounded poll budget
    /// runs out. Returns `true` if the floor was reached.
    ///
    /// Bounded fixed-interval polling rather than an unbounded blocking
    /// primitive: the drains gated by this counter are expected to finish
    /// within seconds.
    pub fn wait_for(&self, floor: u32, platform: &dyn PlatformOps) -> bool {
        let mut loops = 0;
        loop {
            let refs = self.count();
            if refs <= floor {
                debug_assert!(refs == floor);
                return true;
            }
            if loops >= WAIT_MAX_LOOPS {
                return false;
            }
            platform.sleep_ms(WAIT_STEP_MS);
            loops += 1;
        }
    }
}

impl Default for QuiesceRef {
    fn default() -> Self {
        Self::new()
    }
}
