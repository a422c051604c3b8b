//! C2 — the process runtime: `start`, `call`, `cast`, `stop`, and the
//! driver loop that owns a behavior's state and its link/monitor
//! bookkeeping (spec §4.2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

use crate::behavior::Behavior;
use crate::ids;
pub use crate::links::{link, monitor, LinkRef, MonitorRef};
use crate::mailbox::{Envelope, Info, Mailbox, SystemSignal};
use crate::{ExitReason, Process, ProcessError, Ref};

/// Options accepted by [`start`].
pub struct StartOpts {
    pub name: Option<String>,
    pub trap_exit: bool,
    pub init_timeout: Duration,
}

impl Default for StartOpts {
    fn default() -> Self {
        StartOpts {
            name: None,
            trap_exit: false,
            init_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Status {
    Running,
    Stopped(ExitReason),
}

/// A running process. Cloning is cheap — every clone shares the same
/// mailbox and status channel.
pub struct Handle<B: Behavior> {
    id: Arc<str>,
    mailbox: Mailbox<B>,
    status: watch::Receiver<Status>,
}

impl<B: Behavior> Clone for Handle<B> {
    fn clone(&self) -> Self {
        Handle {
            id: self.id.clone(),
            mailbox: self.mailbox.clone(),
            status: self.status.clone(),
        }
    }
}

#[async_trait::async_trait]
impl<B: Behavior> Process for Handle<B> {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_running(&self) -> bool {
        matches!(*self.status.borrow(), Status::Running)
    }

    fn send_system(&self, signal: SystemSignal) {
        let _ = self.mailbox.enqueue(Envelope::System(signal));
    }

    async fn stop(&self, reason: ExitReason, timeout: Duration) {
        Handle::stop(self, reason, timeout).await
    }

    async fn wait_stopped(&self) -> ExitReason {
        self.termination_reason().await
    }
}

impl<B: Behavior> Handle<B> {
    pub fn process_ref(&self) -> Ref {
        Ref::local(self.id.clone())
    }

    pub fn as_process(&self) -> Arc<dyn Process> {
        Arc::new(self.clone())
    }

    /// Synchronous call with a per-call timeout (spec §4.2). Times out with
    /// `CallTimeout` rather than waiting forever on a wedged process.
    pub async fn call(&self, msg: B::Call, call_timeout: Duration) -> Result<B::Reply, ProcessError> {
        let (reply, rx) = oneshot::channel();
        if self
            .mailbox
            .enqueue(Envelope::Call {
                from: None,
                msg,
                reply,
            })
            .is_err()
        {
            return Err(ProcessError::ProcessTerminated(
                self.id.to_string(),
                self.termination_reason().await,
            ));
        }

        match timeout(call_timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(reason))) => Err(ProcessError::ProcessTerminated(self.id.to_string(), reason)),
            Ok(Err(_)) => Err(ProcessError::ProcessTerminated(self.id.to_string(), ExitReason::Normal)),
            Err(_) => Err(ProcessError::CallTimeout {
                ref_id: self.id.to_string(),
                timeout: call_timeout,
            }),
        }
    }

    /// Fire-and-forget cast. Silently dropped if the process has already
    /// terminated (spec §4.2: casts never fail the caller).
    pub fn cast(&self, msg: B::Cast) {
        let _ = self.mailbox.enqueue(Envelope::Cast(msg));
    }

    /// Requests a graceful stop and waits up to `shutdown_timeout` for the
    /// driver loop to finish `terminate` and exit.
    pub async fn stop(&self, reason: ExitReason, shutdown_timeout: Duration) {
        let _ = self.mailbox.enqueue(Envelope::System(SystemSignal::Stop(reason)));
        let mut status = self.status.clone();
        let _ = timeout(shutdown_timeout, async {
            while matches!(*status.borrow(), Status::Running) {
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    /// Waits for the process to have stopped and returns why. Used when an
    /// enqueue races a concurrent shutdown: the mailbox already reports
    /// `closed` but the status channel may not have caught up yet.
    async fn termination_reason(&self) -> ExitReason {
        let mut status = self.status.clone();
        if matches!(*status.borrow(), Status::Running) {
            let _ = status.changed().await;
        }
        let reason = match &*status.borrow() {
            Status::Stopped(reason) => reason.clone(),
            Status::Running => ExitReason::Normal,
        };
        reason
    }
}

/// Spawns `behavior`'s driver loop and runs `init` to completion (or
/// until `opts.init_timeout` elapses) before returning. This makes the
/// spec's "start fails with InitError" observable directly as this call's
/// `Err`, and means no other process can ever hold a [`Ref`] to a process
/// that is still initializing.
pub async fn start<B: Behavior>(mut behavior: B, opts: StartOpts) -> Result<Handle<B>, ProcessError> {
    let id: Arc<str> = ids::generate_process_id().into();
    let mailbox: Mailbox<B> = Mailbox::new();
    let (status_tx, status_rx) = watch::channel(Status::Running);

    let handle = Handle {
        id: id.clone(),
        mailbox: mailbox.clone(),
        status: status_rx,
    };
    behavior.bind_self(handle.as_process());

    let init_result = timeout(opts.init_timeout, behavior.init())
        .await
        .map_err(|_| ProcessError::InitError("init timed out".to_string()))?;
    let state = match init_result {
        Ok(state) => state,
        Err(e) => return Err(ProcessError::InitError(e)),
    };

    tokio::spawn(drive(behavior, state, mailbox, id, status_tx, opts.trap_exit));

    Ok(handle)
}

struct LinkEntry {
    peer: Arc<dyn Process>,
}

async fn drive<B: Behavior>(
    mut behavior: B,
    mut state: B::State,
    mailbox: Mailbox<B>,
    id: Arc<str>,
    status_tx: watch::Sender<Status>,
    trap_exit: bool,
) {
    let mut links: HashMap<String, LinkEntry> = HashMap::new();
    let mut monitored_by: HashMap<String, Arc<dyn Process>> = HashMap::new();
    let self_ref = Ref::local(id.clone());

    let exit_reason = loop {
        let envelope = match mailbox.take_one().await {
            Some(e) => e,
            None => break ExitReason::Normal,
        };

        match envelope {
            Envelope::Call { msg, reply, .. } => match behavior.handle_call(msg, state).await {
                Ok((value, next_state)) => {
                    state = next_state;
                    let _ = reply.send(Ok(value));
                }
                Err(e) => {
                    let reason = ExitReason::Error(e);
                    let _ = reply.send(Err(reason.clone()));
                    break reason;
                }
            },
            Envelope::Cast(msg) => match behavior.handle_cast(msg, state).await {
                Ok(next_state) => state = next_state,
                Err(e) => break ExitReason::Error(e),
            },
            Envelope::Info(info) => match behavior.handle_info(info, state).await {
                Ok(next_state) => state = next_state,
                Err(e) => break ExitReason::Error(e),
            },
            Envelope::System(signal) => match signal {
                SystemSignal::Stop(reason) => break reason,
                SystemSignal::Link { id: link_id, peer } => {
                    links.insert(link_id, LinkEntry { peer });
                }
                SystemSignal::Unlink { id: link_id } => {
                    if let Some(entry) = links.remove(&link_id) {
                        entry.peer.send_system(SystemSignal::Unlink { id: link_id });
                    }
                }
                SystemSignal::LinkExit { id: link_id, from, reason } => {
                    links.remove(&link_id);
                    if !reason.propagates_through_links() {
                        continue;
                    }
                    if trap_exit {
                        match behavior
                            .handle_info(Info::Exit { from, reason }, state)
                            .await
                        {
                            Ok(next_state) => state = next_state,
                            Err(e) => break ExitReason::Error(e),
                        }
                    } else {
                        break ExitReason::Error(format!("linked process {from} exited: {reason}"));
                    }
                }
                SystemSignal::Monitor { id: monitor_id, watcher } => {
                    monitored_by.insert(monitor_id, watcher);
                }
                SystemSignal::Demonitor { id: monitor_id } => {
                    monitored_by.remove(&monitor_id);
                }
                SystemSignal::ProcessDown { monitor_id, target, reason } => {
                    match behavior
                        .handle_info(Info::Down { monitor_id, target, reason }, state)
                        .await
                    {
                        Ok(next_state) => state = next_state,
                        Err(e) => break ExitReason::Error(e),
                    }
                }
            },
        }
    };

    behavior.terminate(&exit_reason, &state).await;
    mailbox.close(exit_reason.clone());
    let _ = status_tx.send(Status::Stopped(exit_reason.clone()));

    for (monitor_id, watcher) in monitored_by {
        watcher.send_system(SystemSignal::ProcessDown {
            monitor_id,
            target: self_ref.clone(),
            reason: exit_reason.clone(),
        });
    }
    for (link_id, entry) in links {
        entry.peer.send_system(SystemSignal::LinkExit {
            id: link_id,
            from: self_ref.clone(),
            reason: exit_reason.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Counter;

    #[async_trait]
    impl Behavior for Counter {
        type Call = ();
        type Cast = i64;
        type UserInfo = ();
        type Reply = i64;
        type State = i64;

        async fn init(&mut self) -> Result<Self::State, String> {
            Ok(0)
        }

        async fn handle_call(
            &mut self,
            _msg: (),
            state: Self::State,
        ) -> Result<(Self::Reply, Self::State), String> {
            Ok((state, state))
        }

        async fn handle_cast(&mut self, delta: i64, state: Self::State) -> Result<Self::State, String> {
            Ok(state + delta)
        }
    }

    struct Failing;

    #[async_trait]
    impl Behavior for Failing {
        type Call = ();
        type Cast = ();
        type UserInfo = ();
        type Reply = ();
        type State = ();

        async fn init(&mut self) -> Result<Self::State, String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn call_and_cast_roundtrip() {
        let handle = start(Counter, StartOpts::default()).await.unwrap();
        handle.cast(5);
        handle.cast(7);
        let total = handle.call((), Duration::from_secs(1)).await.unwrap();
        assert_eq!(total, 12);
    }

    #[tokio::test]
    async fn init_failure_is_reported_to_the_caller() {
        let err = start(Failing, StartOpts::default()).await.unwrap_err();
        assert!(matches!(err, ProcessError::InitError(_)));
    }

    #[tokio::test]
    async fn stop_waits_for_termination() {
        let handle = start(Counter, StartOpts::default()).await.unwrap();
        assert!(handle.is_running());
        handle.stop(ExitReason::Normal, Duration::from_secs(1)).await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn call_after_stop_reports_process_terminated() {
        let handle = start(Counter, StartOpts::default()).await.unwrap();
        handle.stop(ExitReason::Shutdown, Duration::from_secs(1)).await;
        let err = handle.call((), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProcessError::ProcessTerminated(_, ExitReason::Shutdown)));
    }

    #[tokio::test]
    async fn monitor_delivers_process_down() {
        struct Watcher;
        #[async_trait]
        impl Behavior for Watcher {
            type Call = ();
            type Cast = ();
            type UserInfo = ();
            type Reply = Option<ExitReason>;
            type State = Option<ExitReason>;

            async fn init(&mut self) -> Result<Self::State, String> {
                Ok(None)
            }

            async fn handle_info(
                &mut self,
                msg: Info<()>,
                _state: Self::State,
            ) -> Result<Self::State, String> {
                match msg {
                    Info::Down { reason, .. } => Ok(Some(reason)),
                    _ => Ok(None),
                }
            }

            async fn handle_call(
                &mut self,
                _msg: (),
                state: Self::State,
            ) -> Result<(Self::Reply, Self::State), String> {
                Ok((state.clone(), state))
            }
        }

        let target = start(Counter, StartOpts::default()).await.unwrap();
        let watcher = start(Watcher, StartOpts::default()).await.unwrap();

        monitor(watcher.as_process(), target.as_process());
        target.stop(ExitReason::Normal, Duration::from_secs(1)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let observed = watcher.call((), Duration::from_secs(1)).await.unwrap();
        assert_eq!(observed, Some(ExitReason::Normal));
    }
}
