//! PnP handling for the capture device.

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex as SpinMutex;

use crate::bus::{DeviceCaps, LowerDevice, PdoId, PnpMinor, PnpRequest, UsbDeviceDesc};
use crate::cmdq::completion::XferTransport;
use crate::dev::rt::Runtime;
use crate::mon::Monitor;
use crate::platform::PlatformOps;
use crate::status::{Error, Result};
use crate::sync::QuiesceRef;

/// PnP state of the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PnpState {
    StartPending,
    Started,
    StopPending,
    Stopped,
    SurpriseRemoved,
    RemovePending,
    Removed,
}

impl PnpState {
    /// The strict transition graph. `Removed` is terminal; cancel paths
    /// go through [`DdiState::restore`] instead of here.
    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::StartPending, Self::Started)
                | (Self::Started, Self::StopPending)
                | (Self::Started, Self::RemovePending)
                | (Self::Started, Self::SurpriseRemoved)
                | (Self::StopPending, Self::Stopped)
                | (Self::Stopped, Self::RemovePending)
                | (Self::RemovePending, Self::Removed)
                | (Self::SurpriseRemoved, Self::Removed)
        )
    }
}

struct StateCell {
    curr: PnpState,
    /// Saved for cancel-of-stop / cancel-of-remove rollback; meaningful
    /// only while `curr` is one of the pending states.
    prev: PnpState,
}

/// Per-device state: the PnP state pair and the reference count gating
/// teardown.
pub struct DdiState {
    state: SpinMutex<StateCell>,
    refs: QuiesceRef,
}

impl DdiState {
    pub fn new() -> Self {
        Self {
            state: SpinMutex::new(StateCell {
                curr: PnpState::StartPending,
                prev: PnpState::StartPending,
            }),
            refs: QuiesceRef::new(),
        }
    }

    pub fn get(&self) -> PnpState {
        self.state.lock().curr
    }

    /// Moves to `next`, saving the previous state for a possible cancel
    /// rollback. Illegal transitions are refused.
    pub fn set(&self, next: PnpState) -> Result<PnpState> {
        let mut cell = self.state.lock();
        if !cell.curr.can_transition_to(next) {
            log::error!("illegal pnp transition {} -> {next}", cell.curr);
            return Err(Error::InvalidDeviceState);
        }
        cell.prev = cell.curr;
        cell.curr = next;
        log::trace!("pnp {} -> {next}", cell.prev);
        Ok(next)
    }

    /// Rolls back a cancelled stop/remove. Valid only while the current
    /// state is the matching pending state.
    pub fn restore(&self) -> Result<PnpState> {
        let mut cell = self.state.lock();
        if !matches!(cell.curr, PnpState::StopPending | PnpState::RemovePending) {
            return Err(Error::InvalidDeviceState);
        }
        debug_assert_eq!(cell.prev, PnpState::Started);
        cell.curr = cell.prev;
        Ok(cell.curr)
    }

    /// Pins the device for one operation unless it is already removed.
    /// Returns the state observed under the lock.
    pub fn retain_if_not_removed(&self) -> Option<PnpState> {
        let cell = self.state.lock();
        if cell.curr == PnpState::Removed {
            return None;
        }
        let _ = self.refs.retain();
        Some(cell.curr)
    }

    /// Pins the device only while it is fully started.
    pub fn retain_if_started(&self) -> bool {
        let cell = self.state.lock();
        if cell.curr != PnpState::Started {
            return false;
        }
        let _ = self.refs.retain();
        true
    }

    pub fn retain(&self) -> u32 {
        self.refs.retain()
    }

    pub fn release(&self) -> u32 {
        self.refs.release()
    }

    /// Releases the caller's reference and waits until no other operation
    /// is in flight (only the owner reference remains).
    pub fn release_and_wait_completed(&self, platform: &dyn PlatformOps) {
        let _ = self.refs.release();
        let _ = self.refs.wait_for(1, platform);
    }

    /// Releases the owner reference itself and waits for the count to
    /// drain completely.
    pub fn release_and_wait_removed(&self, platform: &dyn PlatformOps) {
        let _ = self.refs.release();
        let _ = self.refs.wait_for(0, platform);
    }
}

impl Default for DdiState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DdiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdiState")
            .field("state", &self.get())
            .field("refs", &self.refs.count())
            .finish()
    }
}

/// The capture device's function-device object.
pub struct UsbDev {
    pdo: PdoId,
    lower: Arc<dyn LowerDevice>,
    monitor: Arc<Monitor>,
    pub(crate) platform: Arc<dyn PlatformOps>,
    pub(crate) ddi: DdiState,
    pub(crate) rt: Runtime,
    caps: SpinMutex<Option<DeviceCaps>>,
}

impl UsbDev {
    pub fn new(
        pdo: PdoId,
        desc: UsbDeviceDesc,
        lower: Arc<dyn LowerDevice>,
        monitor: Arc<Monitor>,
        transport: Arc<dyn XferTransport>,
        platform: Arc<dyn PlatformOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pdo,
            lower,
            monitor,
            platform,
            ddi: DdiState::new(),
            rt: Runtime::new(desc, transport),
            caps: SpinMutex::new(None),
        })
    }

    pub fn pdo(&self) -> PdoId {
        self.pdo
    }

    pub fn pnp_state(&self) -> PnpState {
        self.ddi.get()
    }

    pub fn device_caps(&self) -> Option<DeviceCaps> {
        *self.caps.lock()
    }

    /// The device's PnP dispatch entry point. Every path retains the
    /// device state first (failing closed once removed) and releases on
    /// its way out.
    pub fn dispatch_pnp(&self, request: &mut PnpRequest) -> Result<()> {
        if self.ddi.retain_if_not_removed().is_none() {
            request.status = Err(Error::DeletePending);
            return Err(Error::DeletePending);
        }

        match request.minor {
            PnpMinor::StartDevice => self.mn_start(request),
            PnpMinor::QueryStopDevice => self.mn_query_stop(request),
            PnpMinor::StopDevice => self.mn_stop(request),
            PnpMinor::CancelStopDevice => self.mn_cancel_stop(request),
            PnpMinor::QueryRemoveDevice => self.mn_query_remove(request),
            PnpMinor::RemoveDevice => self.mn_remove(request),
            PnpMinor::CancelRemoveDevice => self.mn_cancel_remove(request),
            PnpMinor::SurpriseRemoval => self.mn_surprise_removal(request),
            PnpMinor::QueryCapabilities => self.mn_query_capabilities(request),
            _ => self.mn_default(request),
        }
    }

    fn mn_start(&self, request: &mut PnpRequest) -> Result<()> {
        let mut status = self.lower.forward(request);
        if status.is_ok() {
            self.rt.start(self.pdo, &self.monitor);
            status = self.ddi.set(PnpState::Started).map(|_| ());
            if status.is_ok() {
                log::info!("{:?} started, runtime published", self.pdo);
            }
        }
        request.status = status;
        self.ddi.release();
        status
    }

    fn mn_query_stop(&self, request: &mut PnpRequest) -> Result<()> {
        if let Err(err) = self.ddi.set(PnpState::StopPending) {
            request.status = Err(err);
            self.ddi.release();
            return Err(err);
        }
        // new work is rejected from here on; drain everything in flight
        self.ddi.release_and_wait_completed(self.platform.as_ref());
        request.status = Ok(());
        self.lower.forward(request)
    }

    fn mn_stop(&self, request: &mut PnpRequest) -> Result<()> {
        if let Err(err) = self.ddi.set(PnpState::Stopped) {
            request.status = Err(err);
            self.ddi.release();
            return Err(err);
        }
        self.rt.clear();
        let status = self.lower.unconfigure();
        if status.is_err() {
            log::warn!("unconfigure of {:?} failed: {status:?}", self.pdo);
        }
        request.status = status;
        let status = self.lower.forward(request);
        self.ddi.release();
        status
    }

    fn mn_cancel_stop(&self, request: &mut PnpRequest) -> Result<()> {
        let observed = self.ddi.get();
        let status = self.lower.forward(request);
        if status.is_ok() && observed == PnpState::StopPending {
            let _ = self.ddi.restore();
        }
        request.status = Ok(());
        self.ddi.release();
        Ok(())
    }

    fn mn_query_remove(&self, request: &mut PnpRequest) -> Result<()> {
        if let Err(err) = self.ddi.set(PnpState::RemovePending) {
            request.status = Err(err);
            self.ddi.release();
            return Err(err);
        }
        self.ddi.release_and_wait_completed(self.platform.as_ref());
        request.status = Ok(());
        self.lower.forward(request)
    }

    fn mn_remove(&self, request: &mut PnpRequest) -> Result<()> {
        let observed = self.ddi.get();
        if observed != PnpState::SurpriseRemoved {
            self.rt.report_stopped(&self.monitor);
        }
        if let Err(err) = self.ddi.set(PnpState::Removed) {
            request.status = Err(err);
            self.ddi.release();
            return Err(err);
        }
        self.ddi.release();
        self.ddi.release_and_wait_removed(self.platform.as_ref());
        self.rt.clear();
        request.status = Ok(());
        let status = self.lower.forward(request);
        log::info!("{:?} detached and deleted", self.pdo);
        status
    }

    fn mn_cancel_remove(&self, request: &mut PnpRequest) -> Result<()> {
        let observed = self.ddi.get();
        let status = self.lower.forward(request);
        if status.is_ok() && observed == PnpState::RemovePending {
            let _ = self.ddi.restore();
        }
        request.status = Ok(());
        self.ddi.release();
        Ok(())
    }

    fn mn_surprise_removal(&self, request: &mut PnpRequest) -> Result<()> {
        if let Err(err) = self.ddi.set(PnpState::SurpriseRemoved) {
            request.status = Err(err);
            self.ddi.release();
            return Err(err);
        }
        self.rt.report_stopped(&self.monitor);
        request.status = Ok(());
        let status = self.lower.forward(request);
        self.ddi.release();
        status
    }

    fn mn_query_capabilities(&self, request: &mut PnpRequest) -> Result<()> {
        let Some(mut caps) = request.caps else {
            request.status = Err(Error::InvalidParameter);
            self.ddi.release();
            return Err(Error::InvalidParameter);
        };
        if caps.version < 1 {
            request.status = Err(Error::InvalidParameter);
            self.ddi.release();
            return Err(Error::InvalidParameter);
        }
        caps.surprise_removal_ok = true;
        request.caps = Some(caps);

        let status = self.lower.forward(request);
        if status.is_ok() {
            *self.caps.lock() = request.caps;
        }
        request.status = status;
        self.ddi.release();
        status
    }

    fn mn_default(&self, request: &mut PnpRequest) -> Result<()> {
        let status = self.lower.forward(request);
        self.ddi.release();
        status
    }
}

impl fmt::Debug for UsbDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDev")
            .field("pdo", &self.pdo)
            .field("state", &self.pnp_state())
            .finish_non_exhaustive()
    }
}
