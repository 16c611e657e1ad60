//! Collaborator model of the surrounding OS driver stack.
//!
//! The monitor hooks a bus driver's dispatch table and the capture device
//! forwards requests to its lower stack; neither is reimplemented here.
//! These types model just enough of driver objects, PnP requests and the
//! USB bus for the engines to operate on and for tests to drive.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex as SpinMutex;

use crate::status::{Error, Result};

/// Identity of a physical device object in the bus driver's device tree.
/// Opaque to the core; stable for the lifetime of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdoId(pub u64);

/// The dispatch-table rows a driver object carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MajorFunction {
    Create = 0,
    Close = 2,
    DeviceControl = 14,
    InternalDeviceControl = 15,
    Pnp = 27,
}

pub const MAX_MAJOR_FUNCTIONS: usize = 28;

/// Identification string families a bus driver answers for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum QueryIdType {
    DeviceId,
    HardwareIds,
    CompatibleIds,
    InstanceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DeviceTextType {
    Description,
    LocationInformation,
}

/// PnP minor function of a request traveling down the device stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PnpMinor {
    StartDevice,
    QueryStopDevice,
    StopDevice,
    CancelStopDevice,
    QueryRemoveDevice,
    RemoveDevice,
    CancelRemoveDevice,
    SurpriseRemoval,
    QueryCapabilities,
    #[display("QueryId({_0})")]
    QueryId(QueryIdType),
    #[display("QueryDeviceText({_0})")]
    QueryDeviceText(DeviceTextType),
    QueryDeviceRelations,
}

/// Device capabilities negotiated during `QueryCapabilities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub version: u32,
    pub removable: bool,
    pub surprise_removal_ok: bool,
    pub unique_id: bool,
}

/// A PnP request. The response payload is mutated in place as the request
/// travels the stack, which is why interceptors snapshot the parameters
/// before forwarding.
#[derive(Debug, Clone)]
pub struct PnpRequest {
    pub pdo: PdoId,
    pub minor: PnpMinor,
    /// Completion status; starts out as not-supported until some driver
    /// in the stack handles the request.
    pub status: Result<()>,
    /// Identification strings returned for `QueryId` / `QueryDeviceText`
    /// requests (a multi-string for the list-valued families).
    pub id_strings: Vec<String>,
    /// Capability block carried by `QueryCapabilities`.
    pub caps: Option<DeviceCaps>,
}

impl PnpRequest {
    pub fn new(pdo: PdoId, minor: PnpMinor) -> Self {
        Self {
            pdo,
            minor,
            status: Err(Error::NotSupported),
            id_strings: Vec::new(),
            caps: None,
        }
    }
}

pub type DispatchFn = Arc<dyn Fn(&mut PnpRequest) -> Result<()> + Send + Sync>;

/// A driver object: a named owner of a dispatch table whose rows can be
/// atomically swapped, which is exactly what the hook engine does.
pub struct DriverObject {
    name: String,
    dispatch: SpinMutex<[Option<DispatchFn>; MAX_MAJOR_FUNCTIONS]>,
}

impl DriverObject {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dispatch: SpinMutex::new([const { None }; MAX_MAJOR_FUNCTIONS]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs `handler` for `major` and returns the previous one.
    pub fn swap_dispatch(&self, major: MajorFunction, handler: Option<DispatchFn>) -> Option<DispatchFn> {
        let mut table = self.dispatch.lock();
        core::mem::replace(&mut table[major as usize], handler)
    }

    pub fn handler(&self, major: MajorFunction) -> Option<DispatchFn> {
        self.dispatch.lock()[major as usize].clone()
    }

    /// Delivers a request through the current dispatch entry, the way the
    /// I/O manager would.
    pub fn dispatch(&self, major: MajorFunction, request: &mut PnpRequest) -> Result<()> {
        let handler = self.handler(major).ok_or(Error::NotSupported)?;
        handler(request)
    }
}

impl fmt::Debug for DriverObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverObject")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Device descriptor fields the filter engine matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceDesc {
    pub vendor: u16,
    pub product: u16,
    pub revision: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The USB bus as the monitor sees it: hubs to hook, children to
/// enumerate, descriptors to read and ports to cycle.
pub trait UsbBus: Send + Sync {
    /// The hub bus drivers whose PnP dispatch gets hooked.
    fn hub_drivers(&self) -> Vec<Arc<DriverObject>>;

    /// Child devices currently reported by all hubs.
    fn enumerate_hub_children(&self) -> Vec<PdoId>;

    /// Reads the device descriptor; `None` when the device is gone or
    /// unresponsive.
    fn device_desc(&self, pdo: PdoId) -> Option<UsbDeviceDesc>;

    /// Cycles the device's port, triggering re-enumeration so a changed
    /// capture decision takes effect.
    fn cycle_port(&self, pdo: PdoId);
}

/// The next-lower device of the capture device's stack.
pub trait LowerDevice: Send + Sync {
    /// Forwards a request down the stack and returns its final status.
    fn forward(&self, request: &mut PnpRequest) -> Result<()>;

    /// Deconfigures the device as part of stop/remove teardown.
    fn unconfigure(&self) -> Result<()>;
}
