//! The monitor context object.
//!
//! Owns the hub hook slots, the filter engine and the open/close
//! lifecycle. Created once at driver attach and passed to every entry
//! point; there is no global monitor state.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex as SpinMutex;

use crate::bus::{DeviceTextType, MajorFunction, PnpMinor, PnpRequest, QueryIdType, UsbBus};
use crate::mon::filter::{
    CAPTURE_DEVICE_TEXT, DevToken, FilterCtx, FilterEngine, capture_compatible_ids,
    capture_device_id, capture_hardware_ids,
};
use crate::mon::hook::{HookEntry, HookRequest};
use crate::platform::PlatformOps;
use crate::status::{Error, Result};

/// Bus drivers hooked at most; matches the setup information the capture
/// driver ships with.
pub const MAX_HOOKED_DRIVERS: usize = 5;

/// Per-open client state of the monitor device.
#[derive(Debug)]
pub struct MonCtx {
    flt: Arc<FilterCtx>,
}

impl MonCtx {
    pub fn filter_ctx(&self) -> &Arc<FilterCtx> {
        &self.flt
    }
}

/// The USB monitor.
pub struct Monitor {
    weak: Weak<Monitor>,
    platform: Arc<dyn PlatformOps>,
    bus: Arc<dyn UsbBus>,
    flt: FilterEngine,
    hooks: SpinMutex<Vec<Arc<HookEntry>>>,
    opens: SpinMutex<u32>,
    /// Latched when hook teardown fails; the module must then stay
    /// loaded, since the bus driver's dispatch table still points at us.
    uninstall_failed: AtomicBool,
}

impl Monitor {
    pub fn new(platform: Arc<dyn PlatformOps>, bus: Arc<dyn UsbBus>) -> Result<Arc<Self>> {
        let flt = FilterEngine::new(Arc::clone(&bus))?;
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            platform,
            bus,
            flt,
            hooks: SpinMutex::new(Vec::new()),
            opens: SpinMutex::new(0),
            uninstall_failed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn filter_engine(&self) -> &FilterEngine {
        &self.flt
    }

    /// Opens the monitor for one client. The first open hooks the hub
    /// drivers' PnP dispatch.
    pub fn open(&self) -> Result<Arc<MonCtx>> {
        {
            let mut opens = self.opens.lock();
            *opens += 1;
            if *opens == 1 {
                if let Err(err) = self.install_hooks() {
                    *opens -= 1;
                    return Err(err);
                }
            }
        }
        Ok(Arc::new(MonCtx {
            flt: self.flt.ctx_create(),
        }))
    }

    /// Closes a client: its filters and captures are released; the last
    /// close tears the hooks down. A failed teardown is converted to
    /// success for the client but latches the prevent-unload flag.
    pub fn close(&self, ctx: &MonCtx) -> Result<()> {
        self.flt.ctx_close(&ctx.flt);
        let last = {
            let mut opens = self.opens.lock();
            debug_assert!(*opens > 0);
            *opens -= 1;
            *opens == 0
        };
        if last {
            if let Err(err) = self.uninstall_hooks() {
                log::warn!("hook uninstall failed ({err}), preventing module unload");
                self.uninstall_failed.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Whether the module may unload: no clients, and no hook ever failed
    /// to uninstall.
    pub fn can_unload(&self) -> bool {
        *self.opens.lock() == 0 && !self.uninstall_failed.load(Ordering::Acquire)
    }

    fn install_hooks(&self) -> Result<()> {
        let drivers = self.bus.hub_drivers();
        let mut hooks = self.hooks.lock();
        for driver in drivers.into_iter().take(MAX_HOOKED_DRIVERS) {
            if hooks.iter().any(|h| Arc::ptr_eq(h.driver(), &driver)) {
                // left over from a failed uninstall; still hooked
                continue;
            }
            let mon_weak = self.weak.clone();
            let entry = Arc::new_cyclic(|entry_weak: &Weak<HookEntry>| {
                let entry_weak = entry_weak.clone();
                let hook_fn: crate::bus::DispatchFn = Arc::new(move |req: &mut PnpRequest| {
                    let entry = entry_weak.upgrade().ok_or(Error::DeletePending)?;
                    let monitor = mon_weak.upgrade().ok_or(Error::DeletePending)?;
                    entry.intercept(req, |record, req| monitor.pnp_completion(record, req))
                });
                HookEntry::new(Arc::clone(&driver), MajorFunction::Pnp, hook_fn)
            });
            entry.install()?;
            hooks.push(entry);
        }
        Ok(())
    }

    fn uninstall_hooks(&self) -> Result<()> {
        let entries: Vec<Arc<HookEntry>> = {
            let mut hooks = self.hooks.lock();
            core::mem::take(&mut *hooks)
        };
        let mut failed = Vec::new();
        for entry in entries {
            if let Err(err) = entry.uninstall(self.platform.as_ref()) {
                log::warn!("unhooking {} failed: {err}", entry.driver().name());
                failed.push(entry);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            // keep the failed entries so their state stays reachable
            self.hooks.lock().extend(failed);
            Err(Error::Busy)
        }
    }

    /// Hook post-processing, run on a request's way back up the stack
    /// against the parameters saved before forwarding.
    fn pnp_completion(&self, record: &HookRequest, request: &mut PnpRequest) {
        match record.saved_minor {
            PnpMinor::QueryId(_) | PnpMinor::QueryDeviceText(_) => {
                if request.status.is_ok() {
                    self.rewrite_identification(record, request);
                } else {
                    log::trace!(
                        "{} for {:?} failed with {:?}",
                        record.saved_minor,
                        record.pdo,
                        request.status
                    );
                }
            }
            PnpMinor::SurpriseRemoval | PnpMinor::RemoveDevice => {
                if request.status.is_ok() {
                    self.flt.pdo_remove(record.pdo);
                } else {
                    log::warn!("{} for {:?} failed", record.saved_minor, record.pdo);
                }
            }
            _ => {}
        }
    }

    /// Substitutes the synthetic capture identity into a successful
    /// identification answer iff the device matches an active filter.
    /// Device and hardware id queries are where the lazy match happens;
    /// the other families only consult the cached decision so every
    /// query for one device answers consistently.
    fn rewrite_identification(&self, record: &HookRequest, request: &mut PnpRequest) {
        let pdo = record.pdo;
        match record.saved_minor {
            PnpMinor::QueryId(QueryIdType::DeviceId) => match self.flt.pdo_add(pdo) {
                Ok(true) => {
                    log::info!("{pdo:?} is filtered, rewriting device id");
                    request.id_strings = alloc::vec![capture_device_id()];
                }
                Ok(false) => log::trace!("{pdo:?} is not filtered"),
                Err(err) => log::warn!("matching {pdo:?} failed: {err}"),
            },
            PnpMinor::QueryId(QueryIdType::HardwareIds) => match self.flt.pdo_add(pdo) {
                Ok(true) => {
                    log::info!("{pdo:?} is filtered, rewriting hardware ids");
                    request.id_strings = capture_hardware_ids();
                }
                Ok(false) => log::trace!("{pdo:?} is not filtered"),
                Err(err) => log::warn!("matching {pdo:?} failed: {err}"),
            },
            PnpMinor::QueryId(QueryIdType::CompatibleIds) => {
                if self.flt.pdo_is_filtered(pdo) {
                    request.id_strings = capture_compatible_ids();
                }
            }
            PnpMinor::QueryDeviceText(DeviceTextType::Description) => {
                if self.flt.pdo_is_filtered(pdo) {
                    request.id_strings = alloc::vec![CAPTURE_DEVICE_TEXT.into()];
                }
            }
            _ => {}
        }
    }

    /// IDC: the capture driver reports it started for `pdo`.
    pub fn proxy_started(&self, pdo: crate::bus::PdoId) -> Option<DevToken> {
        self.flt.proxy_started(pdo)
    }

    /// IDC: the capture driver reports it stopped.
    pub fn proxy_stopped(&self, token: DevToken) {
        self.flt.proxy_stopped(token);
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("opens", &*self.opens.lock())
            .field("hooks", &self.hooks.lock().len())
            .finish_non_exhaustive()
    }
}
