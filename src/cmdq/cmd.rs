//! Reference-counted command buffers.
//!
//! A command is an explicit header-plus-body object shared as
//! [`Arc<Cmd>`]; cloning and dropping the `Arc` are the retain/release
//! discipline, creation hands the caller the initial reference, and the
//! buffer is reclaimed exactly when the last reference drops.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use num_traits::FromPrimitive;
use spin::Mutex as SpinMutex;

use crate::cmdq::session::CmCtx;
use crate::status::{Error, Result};

/// Submission size sentinel: keep the size reserved at creation.
pub const SUBMIT_SIZE_DEFAULT: u32 = u32::MAX;

/// Size of the fixed wire header preceding every command body.
pub const WIRE_HDR_SIZE: u32 = 16;

const SIZE_ALIGN: u32 = 8;

pub(crate) fn round_size(size: u32) -> u32 {
    (size + (SIZE_ALIGN - 1)) & !(SIZE_ALIGN - 1)
}

/// Wire discriminator of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum CmdType {
    /// Payload destined for the user-mode consumer.
    User = 1,
    /// Kernel-internal control command carrying a callback.
    Control = 2,
}

/// Invocation discipline of a control command's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmKind {
    /// Run the callback directly when the command is dequeued.
    PreInvoke,
    /// Defer the callback onto the session's post-process list, to be run
    /// by the drain pass outside the dequeue path.
    PostInvoke,
}

pub type KmCallback = Box<dyn FnOnce(&CmCtx, &Cmd) + Send + Sync>;

pub(crate) struct KmCtl {
    pub(crate) kind: KmKind,
    callback: SpinMutex<Option<KmCallback>>,
}

impl KmCtl {
    /// Takes the callback out; a control command's callback fires at most
    /// once, whichever path gets there first.
    pub(crate) fn take_callback(&self) -> Option<KmCallback> {
        self.callback.lock().take()
    }
}

/// The command body buffer, sized to the 8-byte rounded reservation.
#[derive(Debug, derive_deref::Deref, derive_deref::DerefMut)]
pub struct CmdBody(Box<[u8]>);

impl CmdBody {
    pub(crate) fn new(data: Box<[u8]>) -> Self {
        Self(data)
    }
}

/// A variable-size command carved for one owning context.
pub struct Cmd {
    ctx: Arc<CmCtx>,
    user_tag: u64,
    max_size: u32,
    size: AtomicU32,
    km: Option<KmCtl>,
    body: SpinMutex<CmdBody>,
}

impl Cmd {
    /// Creates a user command with `body_size` bytes of zeroed payload,
    /// rounded up to an 8-byte boundary. The owning context must already
    /// belong to a session.
    pub fn create(ctx: &Arc<CmCtx>, body_size: u32) -> Result<Arc<Self>> {
        Self::create_typed(ctx, body_size, None)
    }

    /// Creates a kernel control command wrapping `callback`.
    pub fn create_control(
        ctx: &Arc<CmCtx>,
        kind: KmKind,
        callback: KmCallback,
        body_size: u32,
    ) -> Result<Arc<Self>> {
        Self::create_typed(
            ctx,
            body_size.max(1),
            Some(KmCtl {
                kind,
                callback: SpinMutex::new(Some(callback)),
            }),
        )
    }

    fn create_typed(ctx: &Arc<CmCtx>, body_size: u32, km: Option<KmCtl>) -> Result<Arc<Self>> {
        if body_size == 0 {
            return Err(Error::InvalidParameter);
        }
        if ctx.session().is_none() {
            return Err(Error::InvalidDeviceState);
        }
        let body_size = round_size(body_size);
        let size = WIRE_HDR_SIZE + body_size;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            user_tag: ctx.user_tag(),
            max_size: size,
            size: AtomicU32::new(size),
            km,
            body: SpinMutex::new(CmdBody(vec![0u8; body_size as usize].into_boxed_slice())),
        }))
    }

    /// Releases a command that was created but never (fully) submitted.
    pub fn cancel(cmd: Arc<Self>) {
        drop(cmd);
    }

    pub fn ty(&self) -> CmdType {
        if self.km.is_some() {
            CmdType::Control
        } else {
            CmdType::User
        }
    }

    /// The opaque tag the owning context carried at creation time.
    pub fn user_tag(&self) -> u64 {
        self.user_tag
    }

    /// Recorded wire size: header plus the (possibly shrunk) body.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub(crate) fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Release);
    }

    pub(crate) fn ctx(&self) -> &Arc<CmCtx> {
        &self.ctx
    }

    pub(crate) fn ctx_serial(&self) -> u64 {
        self.ctx.serial()
    }

    pub(crate) fn km(&self) -> Option<&KmCtl> {
        self.km.as_ref()
    }

    /// Locked access to the body buffer.
    pub fn body(&self) -> spin::MutexGuard<'_, CmdBody> {
        self.body.lock()
    }

    /// Serializes the wire header followed by the recorded body bytes.
    /// The destination must hold [`Cmd::size`] bytes.
    pub(crate) fn encode_into(&self, out: &mut [u8]) {
        let size = self.size();
        debug_assert!(out.len() >= size as usize);
        out[0..4].copy_from_slice(&(self.ty() as u32).to_le_bytes());
        out[4..8].copy_from_slice(&size.to_le_bytes());
        out[8..16].copy_from_slice(&self.user_tag.to_le_bytes());
        let body_len = (size - WIRE_HDR_SIZE) as usize;
        let body = self.body();
        out[16..16 + body_len].copy_from_slice(&body[..body_len]);
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("ty", &self.ty())
            .field("user_tag", &self.user_tag)
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

/// Decoded form of a serialized command header, as the consumer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHdr {
    pub ty: CmdType,
    pub size: u32,
    pub user_tag: u64,
}

impl WireHdr {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < WIRE_HDR_SIZE as usize {
            return Err(Error::BufferTooSmall {
                required: WIRE_HDR_SIZE as usize,
            });
        }
        let raw_ty = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let ty = CmdType::from_u32(raw_ty).ok_or(Error::InvalidParameter)?;
        Ok(Self {
            ty,
            size: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            user_tag: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::cmdq::session::CmdQueueMgr;
    use crate::platform::EventHandle;
    use crate::test_support::TestPlatform;

    #[test]
    fn create_requires_a_session() {
        let platform = Arc::new(TestPlatform::new());
        let mgr = CmdQueueMgr::new(platform);
        let ctx = mgr.create_ctx();
        assert_eq!(Cmd::create(&ctx, 16).unwrap_err(), Error::InvalidDeviceState);
    }

    #[test]
    fn create_rejects_empty_bodies() {
        let platform = Arc::new(TestPlatform::new());
        let _ = platform.register_event(EventHandle(1));
        let mgr = CmdQueueMgr::new(Arc::clone(&platform) as _);
        let ctx = mgr.create_ctx();
        mgr.ctx_add(&ctx, EventHandle(1), 0).unwrap();
        assert_eq!(Cmd::create(&ctx, 0).unwrap_err(), Error::InvalidParameter);
        mgr.ctx_remove(&ctx).unwrap();
    }

    #[test]
    fn sizes_are_rounded_and_tag_copied() {
        let platform = Arc::new(TestPlatform::new());
        let _ = platform.register_event(EventHandle(1));
        let mgr = CmdQueueMgr::new(Arc::clone(&platform) as _);
        let ctx = mgr.create_ctx();
        mgr.ctx_add(&ctx, EventHandle(1), 0xAAAA).unwrap();

        let cmd = Cmd::create(&ctx, 13).unwrap();
        assert_eq!(cmd.size(), WIRE_HDR_SIZE + 16);
        assert_eq!(cmd.max_size(), WIRE_HDR_SIZE + 16);
        assert_eq!(cmd.user_tag(), 0xAAAA);
        assert_eq!(cmd.ty(), CmdType::User);
        assert_eq!(cmd.body().len(), 16);
        mgr.ctx_remove(&ctx).unwrap();
    }

    #[test]
    fn header_round_trips_through_the_wire() {
        let platform = Arc::new(TestPlatform::new());
        let _ = platform.register_event(EventHandle(1));
        let mgr = CmdQueueMgr::new(Arc::clone(&platform) as _);
        let ctx = mgr.create_ctx();
        mgr.ctx_add(&ctx, EventHandle(1), 0xFEED_BEEF).unwrap();

        let cmd = Cmd::create(&ctx, 8).unwrap();
        cmd.body()[..4].copy_from_slice(&[1, 2, 3, 4]);
        let mut out = vec![0u8; cmd.size() as usize];
        cmd.encode_into(&mut out);

        let hdr = WireHdr::decode(&out).unwrap();
        assert_eq!(hdr.ty, CmdType::User);
        assert_eq!(hdr.size, WIRE_HDR_SIZE + 8);
        assert_eq!(hdr.user_tag, 0xFEED_BEEF);
        assert_eq!(&out[16..20], &[1, 2, 3, 4]);
        mgr.ctx_remove(&ctx).unwrap();
    }
}
