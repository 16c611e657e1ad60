//! Two-phase asynchronous command completion.
//!
//! A transfer command wraps a raw buffer with a completion discipline.
//! Synchronous submitters block on a private wait primitive; asynchronous
//! submitters install a callback which either runs where completion is
//! observed, or — for interrupt-context callbacks — may hand back a
//! follow-up to be run later at passive level via the post-process list.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex as SpinMutex;

use crate::cmdq::cmd::CmdBody;
use crate::platform::{PlatformOps, WaitEvent};
use crate::status::XferError;

pub type CompletionFn = Box<dyn FnOnce(&Arc<XferCmd>) + Send + Sync>;
pub type IrqCompletionFn = Box<dyn FnOnce(&Arc<XferCmd>) -> Option<CompletionFn> + Send + Sync>;

/// The completion discipline attached to a command, chosen at prep time.
pub enum Completion {
    /// Nothing left to run for this command.
    None,
    /// Run where completion is observed; deferred to the post-process
    /// list when that happens to be interrupt context.
    Callback(CompletionFn),
    /// Run at interrupt context; may yield a follow-up callback, in which
    /// case the command is not finished and the follow-up is deferred.
    Irq(IrqCompletionFn),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Callback(_) => "Callback",
            Self::Irq(_) => "Irq",
        };
        f.write_str(name)
    }
}

/// A refcounted transfer command handed to the submission channel.
/// Clones of the `Arc` are the retain discipline; the buffer is reclaimed
/// when the last reference drops.
pub struct XferCmd {
    body: SpinMutex<CmdBody>,
    completion: SpinMutex<Completion>,
    result: SpinMutex<XferError>,
}

impl XferCmd {
    pub fn alloc(body_size: usize) -> Arc<Self> {
        Arc::new(Self {
            body: SpinMutex::new(CmdBody::new(vec![0u8; body_size].into_boxed_slice())),
            completion: SpinMutex::new(Completion::None),
            result: SpinMutex::new(XferError::Ok),
        })
    }

    pub fn body(&self) -> spin::MutexGuard<'_, CmdBody> {
        self.body.lock()
    }

    /// The per-command status reported by the device. An unsuccessful
    /// transfer still completes normally; the error is data.
    pub fn result(&self) -> XferError {
        *self.result.lock()
    }

    pub fn set_result(&self, result: XferError) {
        *self.result.lock() = result;
    }

    /// Attaches a deferred (non-interrupt) completion callback and
    /// returns the reference held on behalf of the channel.
    pub fn prep_async(cmd: &Arc<Self>, callback: CompletionFn) -> Arc<Self> {
        *cmd.completion.lock() = Completion::Callback(callback);
        Arc::clone(cmd)
    }

    /// Attaches an interrupt-context completion callback and returns the
    /// reference held on behalf of the channel.
    pub fn prep_async_irq(cmd: &Arc<Self>, callback: IrqCompletionFn) -> Arc<Self> {
        *cmd.completion.lock() = Completion::Irq(callback);
        Arc::clone(cmd)
    }

    /// Prepares a synchronous submission: a private wait primitive is
    /// created and signaled by a built-in completion callback. The caller
    /// submits the returned channel reference, then blocks on the token.
    pub fn prep_sync(cmd: &Arc<Self>, platform: &dyn PlatformOps) -> (Arc<Self>, SyncToken) {
        let event = platform.create_wait_event();
        let signal = Arc::clone(&event);
        *cmd.completion.lock() = Completion::Callback(Box::new(move |_| signal.signal()));
        (Arc::clone(cmd), SyncToken { event })
    }
}

impl fmt::Debug for XferCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XferCmd")
            .field("completion", &*self.completion.lock())
            .field("result", &self.result())
            .finish_non_exhaustive()
    }
}

/// The waitable half of a synchronous submission. Dropping the token
/// without waiting abandons the wait (the primitive is destroyed); the
/// in-flight command completes on its own references.
pub struct SyncToken {
    event: Arc<dyn WaitEvent>,
}

impl SyncToken {
    /// Blocks until the built-in completion callback fires.
    pub fn wait(self) {
        self.event.wait();
    }

    /// Bounded wait; `false` on timeout. The token stays valid so the
    /// caller can cancel the request and then wait for the
    /// acknowledgment.
    pub fn wait_timeout(&self, ms: u32) -> bool {
        self.event.wait_timeout(ms)
    }
}

impl fmt::Debug for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncToken").finish_non_exhaustive()
    }
}

/// The opaque command submission channel: accepts prepared commands and
/// signals their completion back through [`process_completion`].
pub trait XferTransport: Send + Sync {
    /// Hands the command to the hardware channel. The channel owns the
    /// passed reference until completion.
    fn submit(&self, cmd: Arc<XferCmd>) -> crate::status::Result<()>;

    /// Best-effort cancellation of an in-flight command. The command
    /// still completes (with [`XferError::Cancelled`]) through the normal
    /// path; cancellation only bounds the caller's wait.
    fn cancel(&self, cmd: &Arc<XferCmd>);
}

/// Commands whose deferred callbacks await the passive-level drain.
pub type PostProcessList = Vec<Arc<XferCmd>>;

/// Runs the completion step for `cmd`.
///
/// An interrupt-context callback is invoked right away; if it yields a
/// follow-up, the command is not finished and the follow-up is recorded.
/// Any callback still pending is then invoked immediately when not at
/// interrupt context, or appended to `post_list` for the passive-level
/// drain otherwise.
pub fn process_completion(cmd: &Arc<XferCmd>, at_irq: bool, post_list: &mut PostProcessList) {
    let completion = core::mem::replace(&mut *cmd.completion.lock(), Completion::None);
    let pending = match completion {
        // a `None` yield means there is nothing left to do for this one
        Completion::Irq(callback) => callback(cmd),
        Completion::Callback(callback) => Some(callback),
        Completion::None => None,
    };

    if let Some(callback) = pending {
        if at_irq {
            *cmd.completion.lock() = Completion::Callback(callback);
            post_list.push(Arc::clone(cmd));
        } else {
            callback(cmd);
        }
    }
}

/// Drains the deferred list in order, invoking each command's stored
/// callback. Safe against the callback dropping the command's last
/// caller-side reference during its own execution.
pub fn postprocess_completion(post_list: PostProcessList) {
    for cmd in post_list {
        let completion = core::mem::replace(&mut *cmd.completion.lock(), Completion::None);
        if let Completion::Callback(callback) = completion {
            callback(&cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::test_support::TestPlatform;

    #[test]
    fn sync_discipline_signals_and_releases() {
        let platform = TestPlatform::new();
        let cmd = XferCmd::alloc(32);
        let weak = Arc::downgrade(&cmd);
        let (channel_ref, token) = XferCmd::prep_sync(&cmd, &platform);

        let completer = std::thread::spawn(move || {
            channel_ref.set_result(XferError::Stall);
            let mut post = PostProcessList::new();
            process_completion(&channel_ref, false, &mut post);
            assert!(post.is_empty());
        });

        token.wait();
        assert_eq!(cmd.result(), XferError::Stall);
        completer.join().unwrap();
        drop(cmd);
        assert!(weak.upgrade().is_none(), "freed once all references drop");
    }

    #[test]
    fn cancel_sync_does_not_block() {
        let platform = TestPlatform::new();
        let cmd = XferCmd::alloc(8);
        let (channel_ref, token) = XferCmd::prep_sync(&cmd, &platform);
        assert!(!token.wait_timeout(1));
        drop(token);

        // the abandoned command still completes on its own references
        let mut post = PostProcessList::new();
        process_completion(&channel_ref, false, &mut post);
        drop(channel_ref);
    }

    #[test]
    fn deferred_callback_runs_where_completion_is_observed() {
        let fired = Arc::new(AtomicU32::new(0));
        let cmd = XferCmd::alloc(8);
        let observer = Arc::clone(&fired);
        let channel_ref = XferCmd::prep_async(
            &cmd,
            Box::new(move |_| {
                let _ = observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut post = PostProcessList::new();
        process_completion(&channel_ref, false, &mut post);
        assert!(post.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn plain_callback_at_interrupt_context_is_deferred() {
        let fired = Arc::new(AtomicU32::new(0));
        let cmd = XferCmd::alloc(8);
        let observer = Arc::clone(&fired);
        let channel_ref = XferCmd::prep_async(
            &cmd,
            Box::new(move |_| {
                let _ = observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut post = PostProcessList::new();
        process_completion(&channel_ref, true, &mut post);
        assert_eq!(post.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        postprocess_completion(post);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn irq_callback_with_follow_up_runs_in_two_phases() {
        let irq_fired = Arc::new(AtomicU32::new(0));
        let follow_fired = Arc::new(AtomicU32::new(0));
        let cmd = XferCmd::alloc(8);

        let irq = Arc::clone(&irq_fired);
        let follow = Arc::clone(&follow_fired);
        let channel_ref = XferCmd::prep_async_irq(
            &cmd,
            Box::new(move |_| {
                let _ = irq.fetch_add(1, Ordering::SeqCst);
                let follow = Arc::clone(&follow);
                Some(Box::new(move |_: &Arc<XferCmd>| {
                    let _ = follow.fetch_add(1, Ordering::SeqCst);
                }) as CompletionFn)
            }),
        );

        let mut post = PostProcessList::new();
        process_completion(&channel_ref, true, &mut post);
        assert_eq!(irq_fired.load(Ordering::SeqCst), 1);
        assert_eq!(follow_fired.load(Ordering::SeqCst), 0);
        assert_eq!(post.len(), 1);

        postprocess_completion(post);
        assert_eq!(follow_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn irq_callback_without_follow_up_finishes_the_command() {
        let cmd = XferCmd::alloc(8);
        let channel_ref = XferCmd::prep_async_irq(&cmd, Box::new(|_| None));
        let mut post = PostProcessList::new();
        process_completion(&channel_ref, true, &mut post);
        assert!(post.is_empty());
    }

    #[test]
    fn irq_follow_up_runs_immediately_outside_interrupt_context() {
        let follow_fired = Arc::new(AtomicU32::new(0));
        let cmd = XferCmd::alloc(8);
        let follow = Arc::clone(&follow_fired);
        let channel_ref = XferCmd::prep_async_irq(
            &cmd,
            Box::new(move |_| {
                let follow = Arc::clone(&follow);
                Some(Box::new(move |_: &Arc<XferCmd>| {
                    let _ = follow.fetch_add(1, Ordering::SeqCst);
                }) as CompletionFn)
            }),
        );

        let mut post = PostProcessList::new();
        process_completion(&channel_ref, false, &mut post);
        assert!(post.is_empty());
        assert_eq!(follow_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_fires_exactly_once_per_command() {
        const COMMANDS: usize = 64;
        let fired = Arc::new(AtomicU32::new(0));
        let mut weaks = Vec::new();
        let mut threads = Vec::new();

        for _ in 0..COMMANDS {
            let cmd = XferCmd::alloc(16);
            weaks.push(Arc::downgrade(&cmd));
            let observer = Arc::clone(&fired);
            let channel_ref = XferCmd::prep_async(
                &cmd,
                Box::new(move |_| {
                    let _ = observer.fetch_add(1, Ordering::SeqCst);
                }),
            );
            threads.push(std::thread::spawn(move || {
                let mut post = PostProcessList::new();
                process_completion(&channel_ref, true, &mut post);
                postprocess_completion(post);
            }));
        }

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst) as usize, COMMANDS);
        for weak in weaks {
            assert!(weak.upgrade().is_none(), "every command is freed exactly once");
        }
    }

    #[test]
    fn references_are_conserved_across_racing_holders() {
        const HOLDERS: usize = 8;
        for _ in 0..20 {
            let cmd = XferCmd::alloc(8);
            let weak = Arc::downgrade(&cmd);
            let threads: Vec<_> = (0..HOLDERS)
                .map(|i| {
                    let held = Arc::clone(&cmd);
                    std::thread::spawn(move || {
                        let mut local = Vec::new();
                        for n in 0..50 {
                            if (n + i) % 3 == 0 {
                                local.push(Arc::clone(&held));
                            } else {
                                let _ = local.pop();
                            }
                        }
                        drop(local);
                    })
                })
                .collect();
            drop(cmd);
            for t in threads {
                t.join().unwrap();
            }
            assert!(weak.upgrade().is_none());
            assert_eq!(weak.strong_count(), 0);
        }
    }
}
