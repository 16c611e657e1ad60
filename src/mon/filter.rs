//! USB device filtering and capture tracking.
//!
//! Filters describe which devices get steered away from their default
//! driver toward the capture driver. A device is matched lazily, the
//! first time an identification query for it is observed; the decision is
//! cached for the device's lifetime and forgotten only on device removal.
//! An explicit filter run re-walks the bus so that filters registered
//! after boot still capture already-present devices.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex as SpinMutex;

use crate::bus::{PdoId, UsbBus, UsbDeviceDesc};
use crate::cmdq::htable::{HTable, HTableHandle};
use crate::status::{Error, Result};

bitfield::bitfield! {
    /// Vendor/product identity packed into one wire word.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct VidPid(u32);
    impl Debug;
    pub u16, vid, set_vid: 31, 16;
    pub u16, pid, set_pid: 15, 0;
}

/// The synthetic identity the bus reports for captured devices; the
/// capture driver's setup information binds to exactly this VID/PID.
pub const CAPTURE_VID: u16 = 0x90EE;
pub const CAPTURE_PID: u16 = 0xCAFE;

pub fn capture_vid_pid() -> VidPid {
    let mut id = VidPid(0);
    id.set_vid(CAPTURE_VID);
    id.set_pid(CAPTURE_PID);
    id
}

pub fn capture_device_id() -> String {
    let id = capture_vid_pid();
    format!("USB\\Vid_{:04X}&Pid_{:04X}", id.vid(), id.pid())
}

pub fn capture_hardware_ids() -> Vec<String> {
    let id = capture_vid_pid();
    alloc::vec![
        format!("USB\\Vid_{:04X}&Pid_{:04X}&Rev_0100", id.vid(), id.pid()),
        format!("USB\\Vid_{:04X}&Pid_{:04X}", id.vid(), id.pid()),
    ]
}

pub fn capture_compatible_ids() -> Vec<String> {
    alloc::vec![
        String::from("USB\\Class_ff&SubClass_00&Prot_00"),
        String::from("USB\\Class_ff&SubClass_00"),
        String::from("USB\\Class_ff"),
    ]
}

pub const CAPTURE_DEVICE_TEXT: &str = "USB Capture Device";

/// One match criterion: an exact value or a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match<T> {
    Exact(T),
    Any,
}

impl<T: PartialEq> Match<T> {
    fn accepts(&self, value: T) -> bool {
        match self {
            Self::Exact(expected) => *expected == value,
            Self::Any => true,
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

/// Filter classes in evaluation-priority order: exclusions are consulted
/// before captures, one-shots before their persistent counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FilterKind {
    OneshotIgnore,
    Ignore,
    OneshotCapture,
    Capture,
}

impl FilterKind {
    fn rank(self) -> u32 {
        match self {
            Self::OneshotIgnore => 0,
            Self::Ignore => 1,
            Self::OneshotCapture => 2,
            Self::Capture => 3,
        }
    }

    pub fn captures(self) -> bool {
        matches!(self, Self::OneshotCapture | Self::Capture)
    }

    pub fn is_oneshot(self) -> bool {
        matches!(self, Self::OneshotIgnore | Self::OneshotCapture)
    }
}

/// A device filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbFilter {
    pub kind: FilterKind,
    pub vendor: Match<u16>,
    pub product: Match<u16>,
    pub revision: Match<u16>,
    pub class: Match<u8>,
    pub subclass: Match<u8>,
    pub protocol: Match<u8>,
}

impl UsbFilter {
    /// A capture filter matching exactly one vendor/product identity.
    pub fn capture_for(vendor: u16, product: u16) -> Self {
        Self {
            kind: FilterKind::Capture,
            vendor: Match::Exact(vendor),
            product: Match::Exact(product),
            revision: Match::Any,
            class: Match::Any,
            subclass: Match::Any,
            protocol: Match::Any,
        }
    }

    pub fn matches(&self, desc: &UsbDeviceDesc) -> bool {
        self.vendor.accepts(desc.vendor)
            && self.product.accepts(desc.product)
            && self.revision.accepts(desc.revision)
            && self.class.accepts(desc.class)
            && self.subclass.accepts(desc.subclass)
            && self.protocol.accepts(desc.protocol)
    }

    /// Specific filters (exact vendor and product) beat wildcarded ones
    /// within the same class.
    fn is_fully_specific(&self) -> bool {
        self.vendor.is_exact() && self.product.is_exact()
    }
}

/// Per-client filtering context; the owner identity of every filter the
/// client registers.
#[derive(Debug)]
pub struct FilterCtx {
    serial: u64,
    active_filters: AtomicU32,
}

impl FilterCtx {
    pub fn active_filters(&self) -> u32 {
        self.active_filters.load(Ordering::Acquire)
    }
}

/// Opaque per-device token handed to the proxy driver over the IDC
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevToken(PdoId);

#[derive(Debug, Clone, Copy)]
struct FilterSlot {
    owner: u64,
    filter: UsbFilter,
}

#[derive(Debug, Clone, Copy)]
struct DeviceEntry {
    pdo: PdoId,
    desc: Option<UsbDeviceDesc>,
    /// The cached capture decision, set on first identification query.
    filtered: bool,
    owner: Option<u64>,
    proxy_attached: bool,
}

struct FltInner {
    filters: HTable<FilterSlot>,
    devices: Vec<DeviceEntry>,
}

/// The filter/capture engine.
pub struct FilterEngine {
    bus: Arc<dyn UsbBus>,
    inner: SpinMutex<FltInner>,
    next_ctx: AtomicU64,
}

impl FilterEngine {
    pub fn new(bus: Arc<dyn UsbBus>) -> Result<Self> {
        Ok(Self {
            bus,
            inner: SpinMutex::new(FltInner {
                filters: HTable::new(16)?,
                devices: Vec::new(),
            }),
            next_ctx: AtomicU64::new(1),
        })
    }

    /// Opens a filtering context for one client.
    pub fn ctx_create(&self) -> Arc<FilterCtx> {
        Arc::new(FilterCtx {
            serial: self.next_ctx.fetch_add(1, Ordering::Relaxed),
            active_filters: AtomicU32::new(0),
        })
    }

    /// Closes a client context: its filters are removed and the devices
    /// it captured are released back to the host (their ports cycled so
    /// re-enumeration reports true identities again).
    pub fn ctx_close(&self, ctx: &FilterCtx) {
        let mut cycle = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut iter = inner.filters.iter_mut();
            while iter.next().is_some() {
                if iter.value().is_some_and(|slot| slot.owner == ctx.serial) {
                    let _ = iter.remove_current();
                }
            }
            for dev in &mut inner.devices {
                if dev.owner == Some(ctx.serial) {
                    dev.filtered = false;
                    dev.owner = None;
                    cycle.push(dev.pdo);
                }
            }
        }
        ctx.active_filters.store(0, Ordering::Release);
        for pdo in cycle {
            self.bus.cycle_port(pdo);
        }
    }

    /// Registers a filter and returns its removable identifier. The
    /// capture decisions of already-known devices are deliberately left
    /// stale until an explicit filter run.
    pub fn filter_add(&self, ctx: &FilterCtx, filter: UsbFilter) -> Result<HTableHandle> {
        let id = self
            .inner
            .lock()
            .filters
            .put(FilterSlot {
                owner: ctx.serial,
                filter,
            })?;
        let _ = ctx.active_filters.fetch_add(1, Ordering::AcqRel);
        log::info!("filter {id:?} added ({:?})", filter.kind);
        Ok(id)
    }

    /// Removes a filter. Only the owning context may remove it.
    pub fn filter_remove(&self, ctx: &FilterCtx, id: HTableHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.filters.get(id).ok_or(Error::InvalidParameter)?;
        if slot.owner != ctx.serial {
            return Err(Error::AccessDenied);
        }
        let _ = inner.filters.remove(id);
        drop(inner);
        let _ = ctx.active_filters.fetch_sub(1, Ordering::AcqRel);
        log::info!("filter {id:?} removed");
        Ok(())
    }

    /// First-identification-query entry point: matches the device against
    /// the active filters and caches the decision against the device
    /// object. Repeated calls return the cached decision without
    /// re-matching.
    pub fn pdo_add(&self, pdo: PdoId) -> Result<bool> {
        if let Some(filtered) = self.cached_decision(pdo) {
            return Ok(filtered);
        }

        // descriptor reads must not happen under the engine lock
        let Some(desc) = self.bus.device_desc(pdo) else {
            log::warn!("no descriptor for {pdo:?}, leaving it unmatched");
            return Ok(false);
        };

        let mut inner = self.inner.lock();
        if let Some(dev) = inner.devices.iter().find(|d| d.pdo == pdo) {
            return Ok(dev.filtered);
        }
        let hit = match_filters(&mut inner.filters, &desc);
        let (filtered, owner) = match hit {
            Some(hit) => (hit.kind.captures(), Some(hit.owner)),
            None => (false, None),
        };
        inner.devices.push(DeviceEntry {
            pdo,
            desc: Some(desc),
            filtered,
            owner: if filtered { owner } else { None },
            proxy_attached: false,
        });
        log::info!("{pdo:?} is {}filtered", if filtered { "" } else { "NOT " });
        Ok(filtered)
    }

    /// Forgets a removed device. This is the only path that drops the
    /// cached capture decision.
    pub fn pdo_remove(&self, pdo: PdoId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.devices.iter().position(|d| d.pdo == pdo) {
            let dev = inner.devices.swap_remove(pos);
            log::info!("{pdo:?} removed (was {}filtered)", if dev.filtered { "" } else { "not " });
        }
    }

    /// The cached decision; `false` for unknown devices.
    pub fn pdo_is_filtered(&self, pdo: PdoId) -> bool {
        self.cached_decision(pdo).unwrap_or(false)
    }

    fn cached_decision(&self, pdo: PdoId) -> Option<bool> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|d| d.pdo == pdo)
            .map(|d| d.filtered)
    }

    /// Re-walks every hub's child devices and re-evaluates the filter set
    /// against them, so filters registered after enumeration still take
    /// effect. Devices whose capture decision changed get their ports
    /// cycled to force re-enumeration under the new identity.
    pub fn run_filters(&self, ctx: &FilterCtx) -> Result<()> {
        log::info!("running filters for client {}", ctx.serial);
        let children = self.bus.enumerate_hub_children();
        let mut cycle = Vec::new();

        for pdo in children {
            let known_desc = {
                let inner = self.inner.lock();
                inner.devices.iter().find(|d| d.pdo == pdo).and_then(|d| d.desc)
            };
            let desc = match known_desc.or_else(|| self.bus.device_desc(pdo)) {
                Some(desc) => desc,
                None => {
                    log::warn!("no descriptor for {pdo:?}, skipping");
                    continue;
                }
            };

            let mut inner = self.inner.lock();
            let hit = match_filters(&mut inner.filters, &desc);
            let (filtered, owner) = match hit {
                Some(hit) => (hit.kind.captures(), Some(hit.owner)),
                None => (false, None),
            };
            match inner.devices.iter().position(|d| d.pdo == pdo) {
                Some(pos) => {
                    let dev = &mut inner.devices[pos];
                    if dev.filtered != filtered {
                        dev.filtered = filtered;
                        dev.owner = if filtered { owner } else { None };
                        cycle.push(pdo);
                    }
                }
                None => {
                    inner.devices.push(DeviceEntry {
                        pdo,
                        desc: Some(desc),
                        filtered,
                        owner: if filtered { owner } else { None },
                        proxy_attached: false,
                    });
                    if filtered {
                        cycle.push(pdo);
                    }
                }
            }
        }

        for pdo in &cycle {
            self.bus.cycle_port(*pdo);
        }
        log::info!("filter run complete, {} capture change(s)", cycle.len());
        Ok(())
    }

    /// IDC: the proxy driver reports it has started for `pdo`. Returns a
    /// per-device token, or `None` for a device the monitor does not
    /// recognize, which indicates an inconsistency worth surfacing.
    pub fn proxy_started(&self, pdo: PdoId) -> Option<DevToken> {
        let mut inner = self.inner.lock();
        match inner.devices.iter_mut().find(|d| d.pdo == pdo && d.filtered) {
            Some(dev) => {
                dev.proxy_attached = true;
                log::info!("proxy attached to {pdo:?}");
                Some(DevToken(pdo))
            }
            None => {
                log::error!("proxy checked in for unknown device {pdo:?}");
                None
            }
        }
    }

    /// IDC: the proxy driver reports it is going away for the device.
    pub fn proxy_stopped(&self, token: DevToken) {
        let mut inner = self.inner.lock();
        if let Some(dev) = inner.devices.iter_mut().find(|d| d.pdo == token.0) {
            dev.proxy_attached = false;
            log::info!("proxy detached from {:?}", token.0);
        }
    }

    /// Devices currently decided as captured.
    pub fn captured_devices(&self) -> Vec<PdoId> {
        self.inner
            .lock()
            .devices
            .iter()
            .filter(|d| d.filtered)
            .map(|d| d.pdo)
            .collect()
    }
}

impl fmt::Debug for FilterEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FilterEngine")
            .field("filters", &inner.filters.count())
            .field("devices", &inner.devices.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct MatchHit {
    kind: FilterKind,
    owner: u64,
}

/// Walks the filter set in priority order and returns the first hit.
/// One-shot filters are consumed by their match.
fn match_filters(filters: &mut HTable<FilterSlot>, desc: &UsbDeviceDesc) -> Option<MatchHit> {
    let mut best: Option<(u32, HTableHandle, FilterSlot)> = None;
    let mut iter = filters.iter_mut();
    while let Some(id) = iter.next() {
        let slot = *iter.value().expect("iterated slots are occupied");
        if !slot.filter.matches(desc) {
            continue;
        }
        let rank = slot.filter.kind.rank() * 2 + u32::from(!slot.filter.is_fully_specific());
        if best.is_none_or(|(best_rank, ..)| rank < best_rank) {
            best = Some((rank, id, slot));
        }
    }

    let (_, id, slot) = best?;
    if slot.filter.kind.is_oneshot() {
        let _ = filters.remove(id);
    }
    Some(MatchHit {
        kind: slot.filter.kind,
        owner: slot.owner,
    })
}
