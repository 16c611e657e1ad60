//! Runtime surface of a captured device.
//!
//! Once started, the device serves one claiming client: descriptor
//! queries, reset/configuration/interface control and generic transfer
//! submission over the command channel. A transfer the device failed is
//! still a completed request; the device error travels back as data.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex as SpinMutex;

use crate::bus::{PdoId, UsbDeviceDesc};
use crate::cmdq::completion::{XferCmd, XferTransport};
use crate::dev::pnp::UsbDev;
use crate::mon::Monitor;
use crate::mon::filter::DevToken;
use crate::status::{Error, Result, XferError};

/// Operation selector of a command submitted to the channel; the first
/// body byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u8)]
pub enum XferOp {
    Reset = 1,
    SetConfig = 2,
    SelectInterface = 3,
    ClearEndpoint = 4,
    AbortEndpoint = 5,
    Generic = 6,
}

/// Wire size of the cached-descriptor answer.
pub const DESC_WIRE_SIZE: usize = 12;

struct RtState {
    started: bool,
    owner: Option<u64>,
    config: Option<u8>,
    interfaces: Vec<(u8, u8)>,
    token: Option<DevToken>,
}

/// Runtime state of one capture device instance.
pub struct Runtime {
    desc: UsbDeviceDesc,
    transport: Arc<dyn XferTransport>,
    state: SpinMutex<RtState>,
}

impl Runtime {
    pub(crate) fn new(desc: UsbDeviceDesc, transport: Arc<dyn XferTransport>) -> Self {
        Self {
            desc,
            transport,
            state: SpinMutex::new(RtState {
                started: false,
                owner: None,
                config: None,
                interfaces: Vec::new(),
                token: None,
            }),
        }
    }

    /// Brings the runtime up and checks in with the monitor over the
    /// inter-driver channel. An unrecognized device is a consistency
    /// violation on the monitor side; the device still starts.
    pub(crate) fn start(&self, pdo: PdoId, monitor: &Monitor) {
        let token = monitor.proxy_started(pdo);
        if token.is_none() {
            log::error!("monitor does not recognize {pdo:?}");
        }
        let mut state = self.state.lock();
        state.started = true;
        state.token = token;
    }

    /// Reports the proxy stopping over the inter-driver channel.
    pub(crate) fn report_stopped(&self, monitor: &Monitor) {
        let token = self.state.lock().token.take();
        if let Some(token) = token {
            monitor.proxy_stopped(token);
        }
    }

    /// Tears the runtime state down; the device object itself persists.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.started = false;
        state.owner = None;
        state.config = None;
        state.interfaces.clear();
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.lock().started
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Runtime")
            .field("started", &state.started)
            .field("owner", &state.owner)
            .field("config", &state.config)
            .finish_non_exhaustive()
    }
}

impl UsbDev {
    fn with_started<R>(&self, op: impl FnOnce() -> Result<R>) -> Result<R> {
        if !self.ddi.retain_if_started() {
            return Err(Error::InvalidDeviceState);
        }
        let result = op();
        self.ddi.release();
        result
    }

    fn check_owner(&self, client: u64) -> Result<()> {
        if self.rt.state.lock().owner == Some(client) {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }

    /// Claims device ownership for `client`. Reports whether the claim
    /// succeeded; a device already owned by somebody else is not an
    /// error, just not claimed.
    pub fn claim_device(&self, client: u64) -> Result<bool> {
        self.with_started(|| {
            let mut state = self.rt.state.lock();
            let claimed = match state.owner {
                None => {
                    state.owner = Some(client);
                    true
                }
                Some(owner) => owner == client,
            };
            Ok(claimed)
        })
    }

    /// Releases ownership. Only the owner may release.
    pub fn release_device(&self, client: u64) -> Result<()> {
        self.with_started(|| {
            self.check_owner(client)?;
            self.rt.state.lock().owner = None;
            Ok(())
        })
    }

    /// Serializes the cached device descriptor into `out`; a short buffer
    /// reports the required size so the caller can retry.
    pub fn cached_desc(&self, out: &mut [u8]) -> Result<usize> {
        self.with_started(|| {
            if out.len() < DESC_WIRE_SIZE {
                return Err(Error::BufferTooSmall {
                    required: DESC_WIRE_SIZE,
                });
            }
            let desc = &self.rt.desc;
            out[0..2].copy_from_slice(&desc.vendor.to_le_bytes());
            out[2..4].copy_from_slice(&desc.product.to_le_bytes());
            out[4..6].copy_from_slice(&desc.revision.to_le_bytes());
            out[6] = desc.class;
            out[7] = desc.subclass;
            out[8] = desc.protocol;
            out[9..12].fill(0);
            Ok(DESC_WIRE_SIZE)
        })
    }

    pub fn reset(&self, client: u64) -> Result<XferError> {
        self.with_started(|| {
            self.check_owner(client)?;
            self.submit_op(XferOp::Reset, &[], None)
        })
    }

    pub fn set_config(&self, client: u64, config: u8) -> Result<XferError> {
        self.with_started(|| {
            self.check_owner(client)?;
            let result = self.submit_op(XferOp::SetConfig, &[config], None)?;
            if result == XferError::Ok {
                self.rt.state.lock().config = Some(config);
            }
            Ok(result)
        })
    }

    pub fn select_interface(&self, client: u64, interface: u8, alternate: u8) -> Result<XferError> {
        self.with_started(|| {
            self.check_owner(client)?;
            if self.rt.state.lock().config.is_none() {
                return Err(Error::InvalidDeviceState);
            }
            let result = self.submit_op(XferOp::SelectInterface, &[interface, alternate], None)?;
            if result == XferError::Ok {
                let mut state = self.rt.state.lock();
                match state.interfaces.iter().position(|(i, _)| *i == interface) {
                    Some(pos) => state.interfaces[pos].1 = alternate,
                    None => state.interfaces.push((interface, alternate)),
                }
            }
            Ok(result)
        })
    }

    pub fn clear_endpoint(&self, client: u64, endpoint: u8) -> Result<XferError> {
        self.with_started(|| {
            self.check_owner(client)?;
            self.submit_op(XferOp::ClearEndpoint, &[endpoint], None)
        })
    }

    pub fn abort_endpoint(&self, client: u64, endpoint: u8) -> Result<XferError> {
        self.with_started(|| {
            self.check_owner(client)?;
            self.submit_op(XferOp::AbortEndpoint, &[endpoint], None)
        })
    }

    /// Submits a generic transfer and blocks until the device completes
    /// it. With a timeout, the in-flight command is cancelled on expiry
    /// and the cancellation is awaited before control returns.
    pub fn submit_transfer(
        &self,
        client: u64,
        payload: &[u8],
        timeout_ms: Option<u32>,
    ) -> Result<XferError> {
        self.with_started(|| {
            self.check_owner(client)?;
            self.submit_op(XferOp::Generic, payload, timeout_ms)
        })
    }

    fn submit_op(&self, op: XferOp, args: &[u8], timeout_ms: Option<u32>) -> Result<XferError> {
        let cmd = XferCmd::alloc(1 + args.len());
        {
            let mut body = cmd.body();
            body[0] = op as u8;
            body[1..1 + args.len()].copy_from_slice(args);
        }
        let (channel_ref, token) = XferCmd::prep_sync(&cmd, self.platform.as_ref());
        self.rt.transport.submit(channel_ref)?;

        match timeout_ms {
            None => {
                token.wait();
                Ok(cmd.result())
            }
            Some(ms) => {
                if token.wait_timeout(ms) {
                    return Ok(cmd.result());
                }
                log::warn!("{op:?} timed out after {ms} ms, cancelling");
                self.rt.transport.cancel(&cmd);
                // wait for the cancellation to be acknowledged
                token.wait();
                Err(Error::TimedOut)
            }
        }
    }
}
