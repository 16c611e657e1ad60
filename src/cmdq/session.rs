//! Per-client sessions multiplexing command contexts.
//!
//! A session is keyed by the notification event its contexts share; it
//! owns the pending and post-process command lists and an edge-triggered
//! "signal needed" latch. The manager owns the session list. Lock order
//! is strictly outside-in (manager, then session); caller-visible
//! callbacks and event signaling always run with no lock held.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex as SpinMutex;

use crate::cmdq::cmd::{Cmd, CmdType, KmKind, SUBMIT_SIZE_DEFAULT, WIRE_HDR_SIZE};
use crate::cmdq::list::LinkList;
use crate::platform::{Event, EventHandle, PlatformOps, event_identity};
use crate::status::{Error, Result};

/// One logical command context. A context belongs to at most one session
/// at a time and stamps its user tag into every command it creates.
pub struct CmCtx {
    serial: u64,
    user_tag: AtomicU64,
    session: SpinMutex<Option<Arc<CmSession>>>,
}

impl CmCtx {
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn user_tag(&self) -> u64 {
        self.user_tag.load(Ordering::Acquire)
    }

    pub(crate) fn session(&self) -> Option<Arc<CmSession>> {
        self.session.lock().clone()
    }

    /// Whether the context is currently registered with a session.
    pub fn is_registered(&self) -> bool {
        self.session.lock().is_some()
    }
}

impl fmt::Debug for CmCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmCtx")
            .field("serial", &self.serial)
            .field("user_tag", &self.user_tag())
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    contexts: Vec<Arc<CmCtx>>,
    commands: LinkList<Arc<Cmd>>,
    pp_commands: LinkList<Arc<Cmd>>,
    /// Set when the consumer drained to empty and expects a wakeup for
    /// the next pending command.
    event_needed: bool,
}

/// A session: the set of contexts sharing one notification event, plus
/// their pending commands.
pub struct CmSession {
    event: Arc<dyn Event>,
    inner: SpinMutex<SessionInner>,
}

impl fmt::Debug for CmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmSession").finish_non_exhaustive()
    }
}

/// Visitor outcome for one visited command.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisitVerdict {
    /// Detach the command from the pending list; ownership moves to the
    /// visit caller, no reference is released.
    pub remove: bool,
    /// Stop iterating after this command.
    pub stop: bool,
}

/// Result of a [`CmCtx::get_commands`] drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetCommandsInfo {
    /// Bytes of serialized commands written to the caller's buffer.
    pub bytes_returned: usize,
    /// Wire size of the oldest pending command that did not fit, so the
    /// caller can retry with a buffer at least this large.
    pub remaining_first_cmd: u32,
    /// Total wire size of all pending commands that did not fit.
    pub remaining_total: u32,
}

/// Owns every session keyed by client notification events.
pub struct CmdQueueMgr {
    platform: Arc<dyn PlatformOps>,
    sessions: SpinMutex<Vec<Arc<CmSession>>>,
    next_serial: AtomicU64,
}

impl fmt::Debug for CmdQueueMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdQueueMgr").finish_non_exhaustive()
    }
}

impl CmdQueueMgr {
    pub fn new(platform: Arc<dyn PlatformOps>) -> Self {
        Self {
            platform,
            sessions: SpinMutex::new(Vec::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Creates a context that is not registered with any session yet.
    pub fn create_ctx(&self) -> Arc<CmCtx> {
        Arc::new(CmCtx {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            user_tag: AtomicU64::new(0),
            session: SpinMutex::new(None),
        })
    }

    /// Registers `ctx` under the session identified by `event_handle`,
    /// creating the session on first use. The context's user tag is set
    /// to `user_tag` unconditionally, also when joining an existing
    /// session: the tag is always the latest caller-supplied value.
    pub fn ctx_add(&self, ctx: &Arc<CmCtx>, event_handle: EventHandle, user_tag: u64) -> Result<()> {
        let event = self.platform.reference_event(event_handle)?;

        let mut sessions = self.sessions.lock();
        ctx.user_tag.store(user_tag, Ordering::Release);

        let existing = sessions
            .iter()
            .find(|s| event_identity(&s.event) == event_identity(&event))
            .cloned();
        let session = match existing {
            Some(session) => {
                session.inner.lock().contexts.push(Arc::clone(ctx));
                session
            }
            None => {
                let session = Arc::new(CmSession {
                    event,
                    inner: SpinMutex::new(SessionInner {
                        contexts: alloc::vec![Arc::clone(ctx)],
                        commands: LinkList::new(),
                        pp_commands: LinkList::new(),
                        event_needed: true,
                    }),
                });
                sessions.push(Arc::clone(&session));
                session
            }
        };
        *ctx.session.lock() = Some(session);
        Ok(())
    }

    /// Detaches `ctx` from its session. The context's in-flight commands
    /// are cancelled and its deferred post-process callbacks are invoked
    /// directly, since the context that would have consumed them is going
    /// away. The session is destroyed by exactly the removal that empties
    /// its member set; the decision is made under the session lock, while
    /// every cancel/callback/signal runs after all locks are dropped.
    pub fn ctx_remove(&self, ctx: &Arc<CmCtx>) -> Result<()> {
        let cancelled;
        let deferred;
        let destroyed;
        {
            let mut sessions = self.sessions.lock();
            let Some(session) = ctx.session.lock().take() else {
                return Ok(());
            };

            let mut inner = session.inner.lock();
            inner.contexts.retain(|c| c.serial != ctx.serial);
            let destroy = inner.contexts.is_empty();
            if destroy {
                // ensure no commands are left behind whoever owned them
                cancelled = inner.commands.drain_from_tail();
                deferred = inner.pp_commands.drain_from_tail();
                debug_assert!(inner.commands.is_empty());
                debug_assert!(inner.pp_commands.is_empty());
                sessions.retain(|s| !Arc::ptr_eq(s, &session));
            } else {
                cancelled = detach_ctx_cmds(&mut inner.commands, ctx.serial);
                deferred = detach_ctx_cmds(&mut inner.pp_commands, ctx.serial);
            }
            drop(inner);
            destroyed = destroy.then_some(session);
        }

        for cmd in cancelled {
            log::trace!("cancelling command {cmd:?} of removed context");
            Cmd::cancel(cmd);
        }
        for cmd in deferred {
            invoke_km(ctx, &cmd);
        }
        if let Some(session) = destroyed {
            // let a waiting client observe the teardown instead of hanging
            session.event.signal();
        }
        Ok(())
    }

    /// Signals every session's notification event. Used for wake-all
    /// broadcasts such as a device reset.
    pub fn signal_events(&self) {
        let events: Vec<Arc<dyn Event>> = self
            .sessions
            .lock()
            .iter()
            .map(|s| Arc::clone(&s.event))
            .collect();
        for event in events {
            event.signal();
        }
    }

    /// Whether any session's signal latch is still set.
    pub fn has_uncompleted_commands(&self) -> bool {
        let sessions: Vec<Arc<CmSession>> = self.sessions.lock().clone();
        sessions.iter().any(|s| s.inner.lock().event_needed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Drop for CmdQueueMgr {
    fn drop(&mut self) {
        let sessions = self.sessions.lock();
        if !sessions.is_empty() {
            log::warn!("command queue manager dropped with {} live session(s)", sessions.len());
        }
    }
}

fn detach_ctx_cmds(list: &mut LinkList<Arc<Cmd>>, serial: u64) -> Vec<Arc<Cmd>> {
    let mut detached = Vec::new();
    let mut cur = list.front();
    while let Some(id) = cur {
        let next = list.toward_tail(id);
        if list.get(id).is_some_and(|c| c.ctx_serial() == serial) {
            detached.push(list.remove(id).expect("node is live"));
        }
        cur = next;
    }
    detached
}

fn invoke_km(ctx: &CmCtx, cmd: &Arc<Cmd>) {
    let Some(km) = cmd.km() else {
        log::warn!("unsupported command type on the post-process path");
        return;
    };
    if let Some(callback) = km.take_callback() {
        callback(ctx, cmd);
    }
}

impl Cmd {
    /// Posts a command to its session's pending list (at the head). When
    /// `actual_body_size` is not [`SUBMIT_SIZE_DEFAULT`], the recorded
    /// size is shrunk to it; it must not exceed the reservation. The
    /// session event is signaled after the lock is released if the latch
    /// was armed.
    pub fn submit(cmd: &Arc<Cmd>, actual_body_size: u32) -> Result<()> {
        let session = cmd.ctx().session().ok_or(Error::InvalidDeviceState)?;
        if actual_body_size != SUBMIT_SIZE_DEFAULT {
            let size = WIRE_HDR_SIZE + actual_body_size;
            if size > cmd.max_size() {
                return Err(Error::InvalidParameter);
            }
            cmd.set_size(size);
        }

        let signal = {
            let mut inner = session.inner.lock();
            let _ = inner.commands.push_front(Arc::clone(cmd));
            if inner.event_needed {
                inner.event_needed = false;
                true
            } else {
                false
            }
        };
        if signal {
            session.event.signal();
        }
        Ok(())
    }
}

impl CmCtx {
    /// Walks the pending list from the head (newest first), invoking the
    /// visitor for every user command owned by this context, or every
    /// user command when `entire_session` is set. Commands the visitor
    /// asks to remove are detached and returned to the caller with their
    /// references intact. The visitor runs under the session lock and
    /// must neither block nor reenter the queue.
    pub fn visit(
        &self,
        entire_session: bool,
        mut visitor: impl FnMut(&Cmd) -> VisitVerdict,
    ) -> Result<Vec<Arc<Cmd>>> {
        let session = self.session().ok_or(Error::InvalidDeviceState)?;
        let mut removed = Vec::new();

        let mut inner = session.inner.lock();
        let mut cur = inner.commands.front();
        while let Some(id) = cur {
            let next = inner.commands.toward_tail(id);
            let cmd = Arc::clone(inner.commands.get(id).expect("node is live"));
            if entire_session || cmd.ctx_serial() == self.serial {
                if cmd.ty() == CmdType::User {
                    let verdict = visitor(&cmd);
                    if verdict.remove {
                        removed.push(inner.commands.remove(id).expect("node is live"));
                    }
                    if verdict.stop {
                        break;
                    }
                } else {
                    log::warn!("non-user command on visit, skipping");
                }
            }
            cur = next;
        }
        drop(inner);
        Ok(removed)
    }

    /// Drains pending commands into `out`, oldest first, until the next
    /// one no longer fits; reports the sizes still pending so the caller
    /// can retry with a bigger buffer. Control commands encountered are
    /// executed (pre-invoke) or deferred to the post-process list
    /// (post-invoke); this context's deferred callbacks are drained
    /// first. Re-arms the session's signal latch when the queue empties.
    pub fn get_commands(&self, out: &mut [u8]) -> Result<GetCommandsInfo> {
        let session = self.session().ok_or(Error::InvalidDeviceState)?;
        let mut info = GetCommandsInfo::default();
        let deferred;
        let mut detached = Vec::new();
        {
            let mut inner = session.inner.lock();
            deferred = detach_ctx_cmds(&mut inner.pp_commands, self.serial);

            let mut budget = out.len();
            loop {
                let Some(id) = inner.commands.back() else {
                    inner.event_needed = true;
                    break;
                };
                let cmd = inner.commands.get(id).expect("node is live");
                let user_size = if cmd.ty() == CmdType::User { cmd.size() } else { 0 };
                if budget >= user_size as usize {
                    detached.push(inner.commands.remove(id).expect("node is live"));
                    budget -= user_size as usize;
                } else {
                    info.remaining_first_cmd = user_size;
                    info.remaining_total = user_size;
                    let mut cur = inner.commands.toward_head(id);
                    while let Some(rest) = cur {
                        let cmd = inner.commands.get(rest).expect("node is live");
                        if cmd.ty() == CmdType::User {
                            info.remaining_total += cmd.size();
                        }
                        cur = inner.commands.toward_head(rest);
                    }
                    break;
                }
            }
        }

        for cmd in deferred {
            invoke_km(self, &cmd);
        }

        for cmd in detached {
            match cmd.ty() {
                CmdType::User => {
                    let size = cmd.size() as usize;
                    cmd.encode_into(&mut out[info.bytes_returned..info.bytes_returned + size]);
                    info.bytes_returned += size;
                    // dropping the command here is the dequeue's release
                }
                CmdType::Control => self.process_km(&session, cmd),
            }
        }
        Ok(info)
    }

    fn process_km(&self, session: &Arc<CmSession>, cmd: Arc<Cmd>) {
        match cmd.km().map(|km| km.kind) {
            Some(KmKind::PreInvoke) => invoke_km(self, &cmd),
            Some(KmKind::PostInvoke) => {
                let mut inner = session.inner.lock();
                let _ = inner.pp_commands.push_back(cmd);
            }
            None => log::warn!("user command routed to control processing"),
        }
    }
}
