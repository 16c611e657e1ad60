//! Driver dispatch table hooking.

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex as SpinMutex;

use crate::bus::{DispatchFn, DriverObject, MajorFunction, PdoId, PnpMinor, PnpRequest};
use crate::cmdq::list::LinkList;
use crate::platform::PlatformOps;
use crate::status::{Error, Result};
use crate::sync::QuiesceRef;

/// Snapshot of a hooked request taken before it is forwarded.
///
/// The request object is mutated in place on its way down the stack, and
/// the completion side of the hook runs at a different stack level than
/// the hook itself, so post-processing must work against what the
/// request looked like before any lower driver touched it.
#[derive(Debug, Clone, Copy)]
pub struct HookRequest {
    pub pdo: PdoId,
    pub saved_minor: PnpMinor,
}

struct HookState {
    installed: bool,
    original: Option<DispatchFn>,
}

/// A dispatch-table hook on one major function of one driver object.
pub struct HookEntry {
    driver: Arc<DriverObject>,
    major: MajorFunction,
    hook_fn: DispatchFn,
    state: SpinMutex<HookState>,
    refs: QuiesceRef,
    requests: SpinMutex<LinkList<HookRequest>>,
}

impl HookEntry {
    pub fn new(driver: Arc<DriverObject>, major: MajorFunction, hook_fn: DispatchFn) -> Self {
        Self {
            driver,
            major,
            hook_fn,
            state: SpinMutex::new(HookState {
                installed: false,
                original: None,
            }),
            refs: QuiesceRef::new(),
            requests: SpinMutex::new(LinkList::new()),
        }
    }

    pub fn driver(&self) -> &Arc<DriverObject> {
        &self.driver
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().installed
    }

    /// Swaps the target's dispatch entry for the hook function,
    /// remembering the original handler. Refuses a second install: doing
    /// the swap again would capture our own hook as the "original" and
    /// corrupt the saved handler.
    pub fn install(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.installed || state.original.is_some() {
            log::warn!(
                "hook already installed on {} (mj {:?})",
                self.driver.name(),
                self.major
            );
            return Err(Error::InvalidDeviceState);
        }
        state.original = self.driver.swap_dispatch(self.major, Some(Arc::clone(&self.hook_fn)));
        state.installed = true;
        log::info!("hooked {} (mj {:?})", self.driver.name(), self.major);
        Ok(())
    }

    /// Restores the original handler once every in-flight hooked request
    /// has drained.
    ///
    /// New interceptions are blocked immediately; the drain is a bounded
    /// poll. On drain failure the dispatch entry is left pointing at the
    /// hook (requests pass straight through via the skip path) and
    /// [`Error::Busy`] is returned; the caller may retry.
    pub fn uninstall(&self, platform: &dyn PlatformOps) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.original.is_none() {
                return Err(Error::InvalidDeviceState);
            }
            state.installed = false;
        }

        if !self.refs.wait_for(1, platform) {
            log::warn!(
                "uninstall of {} (mj {:?}) failed, requests still in flight",
                self.driver.name(),
                self.major
            );
            return Err(Error::Busy);
        }

        let mut state = self.state.lock();
        let original = state.original.take();
        let _ = self.driver.swap_dispatch(self.major, original);
        log::info!("unhooked {} (mj {:?})", self.driver.name(), self.major);
        Ok(())
    }

    /// Pins the hook for one request. Fails closed while an uninstall is
    /// in progress so no request starts interception on a hook that is
    /// going away.
    pub fn retain(&self) -> bool {
        let state = self.state.lock();
        if !state.installed {
            return false;
        }
        let _ = self.refs.retain();
        true
    }

    pub fn release(&self) {
        let _ = self.refs.release();
    }

    fn original(&self) -> Option<DispatchFn> {
        self.state.lock().original.clone()
    }

    /// Forwards a request straight to the original handler, bypassing
    /// interception. Used when the hook cannot be retained.
    pub fn pass_down_skip(&self, request: &mut PnpRequest) -> Result<()> {
        match self.original() {
            Some(handler) => handler(request),
            None => Err(Error::NotSupported),
        }
    }

    /// The per-request interception flow: retain, snapshot, forward to
    /// the next-lower handler, run `post_process` against the snapshot on
    /// the way back up, release.
    pub fn intercept(
        &self,
        request: &mut PnpRequest,
        post_process: impl FnOnce(&HookRequest, &mut PnpRequest),
    ) -> Result<()> {
        if !self.retain() {
            log::warn!("hook retain failed, passing the request through");
            return self.pass_down_skip(request);
        }

        let record = HookRequest {
            pdo: request.pdo,
            saved_minor: request.minor,
        };
        let id = self.requests.lock().push_front(record);

        let status = match self.original() {
            Some(handler) => handler(request),
            None => Err(Error::NotSupported),
        };

        post_process(&record, request);

        let _ = self.requests.lock().remove(id);
        self.release();
        status
    }

    /// Number of hooked requests currently in flight.
    pub fn requests_in_flight(&self) -> usize {
        self.requests.lock().len()
    }
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("driver", &self.driver.name())
            .field("major", &self.major)
            .field("installed", &self.is_installed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    use super::*;
    use crate::bus::QueryIdType;
    use crate::test_support::TestPlatform;

    fn hooked_driver(
        original_hits: Arc<AtomicU32>,
        post_hits: Arc<AtomicU32>,
    ) -> (Arc<DriverObject>, Arc<HookEntry>) {
        let driver = DriverObject::new("usbhub");
        let hits = Arc::clone(&original_hits);
        let _ = driver.swap_dispatch(
            MajorFunction::Pnp,
            Some(Arc::new(move |req: &mut PnpRequest| {
                let _ = hits.fetch_add(1, Ordering::SeqCst);
                req.status = Ok(());
                Ok(())
            })),
        );

        let entry = Arc::new_cyclic(|weak: &alloc::sync::Weak<HookEntry>| {
            let weak = weak.clone();
            let hook_fn: DispatchFn = Arc::new(move |req: &mut PnpRequest| {
                let entry = weak.upgrade().ok_or(Error::DeletePending)?;
                let post_hits = Arc::clone(&post_hits);
                entry.intercept(req, move |_record, _req| {
                    let _ = post_hits.fetch_add(1, Ordering::SeqCst);
                })
            });
            HookEntry::new(Arc::clone(&driver), MajorFunction::Pnp, hook_fn)
        });
        (driver, entry)
    }

    fn query_id(pdo: u64) -> PnpRequest {
        PnpRequest::new(PdoId(pdo), PnpMinor::QueryId(QueryIdType::DeviceId))
    }

    #[test]
    fn installed_hook_intercepts_and_forwards() {
        let original = Arc::new(AtomicU32::new(0));
        let post = Arc::new(AtomicU32::new(0));
        let (driver, entry) = hooked_driver(Arc::clone(&original), Arc::clone(&post));
        entry.install().unwrap();

        let mut req = query_id(1);
        driver.dispatch(MajorFunction::Pnp, &mut req).unwrap();
        assert_eq!(original.load(Ordering::SeqCst), 1);
        assert_eq!(post.load(Ordering::SeqCst), 1);
        assert!(req.status.is_ok());
        assert_eq!(entry.requests_in_flight(), 0);
    }

    #[test]
    fn double_install_is_refused() {
        let (_driver, entry) = hooked_driver(Arc::default(), Arc::default());
        entry.install().unwrap();
        assert_eq!(entry.install(), Err(Error::InvalidDeviceState));
    }

    #[test]
    fn uninstall_restores_the_original_handler() {
        let original = Arc::new(AtomicU32::new(0));
        let post = Arc::new(AtomicU32::new(0));
        let (driver, entry) = hooked_driver(Arc::clone(&original), Arc::clone(&post));
        let platform = TestPlatform::new();

        entry.install().unwrap();
        entry.uninstall(&platform).unwrap();
        assert!(!entry.is_installed());

        let mut req = query_id(1);
        driver.dispatch(MajorFunction::Pnp, &mut req).unwrap();
        assert_eq!(original.load(Ordering::SeqCst), 1);
        assert_eq!(post.load(Ordering::SeqCst), 0, "interception is gone");

        assert_eq!(
            entry.uninstall(&platform),
            Err(Error::InvalidDeviceState),
            "nothing left to uninstall"
        );
    }

    #[test]
    fn retain_fails_closed_mid_uninstall_and_requests_pass_through() {
        let original = Arc::new(AtomicU32::new(0));
        let post = Arc::new(AtomicU32::new(0));
        let (driver, entry) = hooked_driver(Arc::clone(&original), Arc::clone(&post));
        entry.install().unwrap();

        // uninstall with a request pinned: drain fails, interception stays off
        assert!(entry.retain());
        let platform = TestPlatform::new();
        assert_eq!(entry.uninstall(&platform), Err(Error::Busy));
        assert!(!entry.is_installed());
        assert!(!entry.retain());

        let mut req = query_id(1);
        driver.dispatch(MajorFunction::Pnp, &mut req).unwrap();
        assert_eq!(original.load(Ordering::SeqCst), 1);
        assert_eq!(post.load(Ordering::SeqCst), 0, "pass-through skips post-processing");

        // the pinned request drains; a retry succeeds
        entry.release();
        entry.uninstall(&platform).unwrap();
    }

    #[test]
    fn uninstall_waits_for_in_flight_requests() {
        let (driver, entry) = {
            let driver = DriverObject::new("usbhub");
            let (block_tx, block_rx) = mpsc::channel::<()>();
            let block_rx = std::sync::Mutex::new(block_rx);
            let _ = driver.swap_dispatch(
                MajorFunction::Pnp,
                Some(Arc::new(move |req: &mut PnpRequest| {
                    block_rx.lock().unwrap().recv().unwrap();
                    req.status = Ok(());
                    Ok(())
                })),
            );
            let entry = Arc::new_cyclic(|weak: &alloc::sync::Weak<HookEntry>| {
                let weak = weak.clone();
                let hook_fn: DispatchFn = Arc::new(move |req: &mut PnpRequest| {
                    let entry = weak.upgrade().ok_or(Error::DeletePending)?;
                    entry.intercept(req, |_, _| {})
                });
                HookEntry::new(Arc::clone(&driver), MajorFunction::Pnp, hook_fn)
            });
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                block_tx.send(()).unwrap();
            });
            (driver, entry)
        };
        entry.install().unwrap();

        let in_flight = {
            let driver = Arc::clone(&driver);
            std::thread::spawn(move || {
                let mut req = query_id(7);
                driver.dispatch(MajorFunction::Pnp, &mut req)
            })
        };
        // let the request reach the blocked lower handler
        while entry.requests_in_flight() == 0 {
            std::thread::yield_now();
        }

        let platform = TestPlatform::new();
        entry.uninstall(&platform).unwrap();
        in_flight.join().unwrap().unwrap();
        assert_eq!(entry.requests_in_flight(), 0);

        assert!(!entry.retain(), "the hook is gone for good");
    }
}
