//! The [`Mailbox`] is the FIFO queue of [`Envelope`]s delivered to one
//! process. Exactly one task (the process's own driver loop) ever calls
//! [`Mailbox::take_one`]; any number of senders may [`Mailbox::enqueue`]
//! concurrently.
//!
//! Adapted from the teacher's `MessageMailbox` (a `Mutex` + hand-rolled
//! `Future`/`Waker` pair supporting selective receive by tag). This system
//! has no tag-based selective receive, so the blocking wait is expressed
//! with `tokio::sync::Notify` instead — the queue-plus-waker shape is kept,
//! the tag matching is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};

use crate::behavior::Behavior;
use crate::{ExitReason, Ref};

/// One item waiting in a process's mailbox.
pub enum Envelope<B: Behavior> {
    Call {
        from: Option<Ref>,
        msg: B::Call,
        reply: oneshot::Sender<Result<B::Reply, ExitReason>>,
    },
    Cast(B::Cast),
    Info(Info<B::UserInfo>),
    System(SystemSignal),
}

/// Delivered through `handle_info`: either a user-level info message, or a
/// synthesized notification from the link/monitor machinery.
pub enum Info<T> {
    User(T),
    Exit {
        from: Ref,
        reason: ExitReason,
    },
    Down {
        monitor_id: String,
        target: Ref,
        reason: ExitReason,
    },
}

/// System-level signals handled by the driver loop itself, never forwarded
/// to a user callback directly (though some produce an `Info` envelope as a
/// side effect — see [`crate::runtime`]).
pub enum SystemSignal {
    Stop(ExitReason),
    Link {
        id: String,
        peer: Arc<dyn crate::Process>,
    },
    Unlink {
        id: String,
    },
    LinkExit {
        id: String,
        from: Ref,
        reason: ExitReason,
    },
    Monitor {
        id: String,
        watcher: Arc<dyn crate::Process>,
    },
    Demonitor {
        id: String,
    },
    ProcessDown {
        monitor_id: String,
        target: Ref,
        reason: ExitReason,
    },
}

/// Failure to enqueue into a mailbox that has already been closed.
#[derive(Debug, thiserror::Error)]
#[error("mailbox is closed")]
pub struct MailboxClosed;

struct Inner<B: Behavior> {
    queue: std::sync::Mutex<VecDeque<Envelope<B>>>,
    notify: Notify,
    closed: AtomicBool,
}

/// FIFO mailbox of one process. Cloning shares the same underlying queue.
pub struct Mailbox<B: Behavior> {
    inner: Arc<Inner<B>>,
}

impl<B: Behavior> Clone for Mailbox<B> {
    fn clone(&self) -> Self {
        Mailbox {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Behavior> Default for Mailbox<B> {
    fn default() -> Self {
        Mailbox {
            inner: Arc::new(Inner {
                queue: std::sync::Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl<B: Behavior> Mailbox<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an envelope onto the back of the queue. Fails once the
    /// mailbox has been closed; a rejected `Call`'s reply handle is simply
    /// dropped with the envelope, so the caller sees a closed channel.
    pub fn enqueue(&self, env: Envelope<B>) -> Result<(), MailboxClosed> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MailboxClosed);
        }
        self.inner
            .queue
            .lock()
            .expect("mailbox mutex poisoned")
            .push_back(env);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Returns the next envelope in FIFO order, waiting if none is queued.
    /// Returns `None` once the mailbox is closed and drained.
    pub async fn take_one(&self) -> Option<Envelope<B>> {
        loop {
            if let Some(env) = self
                .inner
                .queue
                .lock()
                .expect("mailbox mutex poisoned")
                .pop_front()
            {
                return Some(env);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Closes the mailbox: no further `enqueue` succeeds, and every
    /// still-queued `Call` has its reply handle completed with
    /// `ProcessTerminated(reason)` so the caller never hangs.
    pub fn close(&self, reason: ExitReason) {
        self.inner.closed.store(true, Ordering::Release);
        let mut queue = self.inner.queue.lock().expect("mailbox mutex poisoned");
        for env in queue.drain(..) {
            if let Envelope::Call { reply, .. } = env {
                let _ = reply.send(Err(reason.clone()));
            }
        }
        drop(queue);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .expect("mailbox mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
