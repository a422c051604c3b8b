//! C5 — the supervision tree (spec §4.5). A [`Supervisor`] is itself an
//! ordinary [`actormesh_process::Process`] (built on top of
//! [`actormesh_process::Behavior`]), so supervisors nest: a crashed
//! supervisor cascades to whatever supervises it exactly like any other
//! child.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};

use actormesh_process::{Behavior, ExitReason, Info, Process, ProcessError, Ref, StartOpts};

/// How a supervisor reacts when one child exits (spec §4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Restart only the child that crashed.
    OneForOne,
    /// Terminate every child (reverse start order) then restart them all.
    OneForAll,
    /// Terminate children started after the crashed one, then restart the
    /// crashed child and everything after it, in original order.
    RestForOne,
}

/// Per-child restart eligibility (spec §4.5's restart table).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartPolicy {
    /// Restart on any exit reason.
    Permanent,
    /// Restart only on an abnormal exit (not `normal`/`shutdown`).
    Transient,
    /// Never restart; an exit simply removes the child.
    Temporary,
}

impl RestartPolicy {
    fn restarts_on(&self, reason: &ExitReason) -> bool {
        match self {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => {
                !matches!(reason, ExitReason::Normal | ExitReason::Shutdown)
            }
            RestartPolicy::Temporary => false,
        }
    }
}

type StartFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn Process>, String>> + Send>>;
type StartFn = Arc<dyn Fn() -> StartFuture + Send + Sync>;

/// A child's start recipe. Kept as a boxed factory so a crashed child can
/// be rebuilt from scratch with the same construction logic.
pub struct ChildSpec {
    pub id: String,
    pub restart: RestartPolicy,
    pub shutdown_timeout: Duration,
    start: StartFn,
}

impl ChildSpec {
    pub fn new<F, Fut>(id: impl Into<String>, restart: RestartPolicy, start: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Process>, String>> + Send + 'static,
    {
        ChildSpec {
            id: id.into(),
            restart,
            shutdown_timeout: Duration::from_secs(5),
            start: Arc::new(move || Box::pin(start())),
        }
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Sliding-window restart quota (spec §4.5, invariant 6).
#[derive(Clone, Debug)]
pub struct Intensity {
    pub max_restarts: usize,
    pub within: Duration,
}

impl Default for Intensity {
    fn default() -> Self {
        Intensity {
            max_restarts: 3,
            within: Duration::from_secs(5),
        }
    }
}

/// Declarative spec for one supervisor (spec §4.5's supervisor record).
pub struct SupervisorSpec {
    pub strategy: Strategy,
    pub intensity: Intensity,
    pub children: Vec<ChildSpec>,
}

impl SupervisorSpec {
    pub fn new(strategy: Strategy, children: Vec<ChildSpec>) -> Self {
        SupervisorSpec {
            strategy,
            intensity: Intensity::default(),
            children,
        }
    }

    pub fn intensity(mut self, intensity: Intensity) -> Self {
        self.intensity = intensity;
        self
    }
}

/// Snapshot of one child, returned by `children`/`get_child`.
#[derive(Clone, Debug)]
pub struct ChildInfo {
    pub id: String,
    pub process_ref: Option<Ref>,
    pub running: bool,
}

/// Calls accepted by a running supervisor (spec §4.5's public ops).
pub enum SupervisorCall {
    Children,
    GetChild(String),
}

/// Replies to [`SupervisorCall`].
pub enum SupervisorReply {
    Children(Vec<ChildInfo>),
    Child(Option<ChildInfo>),
}

/// A running supervisor currently accepts no casts; self-binding happens
/// through [`Behavior::bind_self`] instead of a message, so children
/// started from `init` are monitored before any of them can crash
/// unobserved.
pub enum SupervisorCast {}

struct ChildRuntime {
    spec_index: usize,
    process: Option<Arc<dyn Process>>,
    monitor_id: Option<String>,
}

/// The [`Behavior`] backing every [`Supervisor`]. `State` carries the live
/// child roster; everything else (specs, strategy, intensity bookkeeping)
/// lives directly on the behavior struct since it never needs to travel
/// through a reply.
pub struct SupervisorBehavior {
    specs: Vec<ChildSpec>,
    strategy: Strategy,
    intensity: Intensity,
    restart_timestamps: VecDeque<Instant>,
    monitor_index: HashMap<String, usize>,
    self_process: Option<Arc<dyn Process>>,
}

impl SupervisorBehavior {
    fn new(spec: SupervisorSpec) -> Self {
        SupervisorBehavior {
            specs: spec.children,
            strategy: spec.strategy,
            intensity: spec.intensity,
            restart_timestamps: VecDeque::new(),
            monitor_index: HashMap::new(),
            self_process: None,
        }
    }

    async fn start_one(&self, spec_index: usize) -> Result<Arc<dyn Process>, String> {
        (self.specs[spec_index].start)().await
    }

    /// Records one restart attempt against the sliding window. Returns
    /// `false` once recording it would exceed `max_restarts` within
    /// `within` — the caller must then terminate the whole supervisor.
    fn record_restart(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.restart_timestamps.front() {
            if now.duration_since(oldest) > self.intensity.within {
                self.restart_timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.restart_timestamps.len() >= self.intensity.max_restarts {
            return false;
        }
        self.restart_timestamps.push_back(now);
        true
    }

    fn monitor_child(&mut self, index: usize, runtime: &mut ChildRuntime) {
        let Some(self_process) = self.self_process.clone() else {
            return;
        };
        let Some(process) = runtime.process.as_ref() else {
            return;
        };
        let monitor_ref = actormesh_process::monitor(self_process, process.clone());
        self.monitor_index.insert(monitor_ref.id().to_string(), index);
        runtime.monitor_id = Some(monitor_ref.id().to_string());
    }

    async fn stop_child(&self, runtime: &ChildRuntime) {
        if let Some(process) = &runtime.process {
            let timeout = self.specs[runtime.spec_index].shutdown_timeout;
            process.stop(ExitReason::Shutdown, timeout).await;
        }
    }

    /// Starts every child in declared order. A start failure is treated
    /// like a crash under that child's restart policy: a restart-eligible
    /// child gets one immediate retry; an ineligible (`temporary`, or
    /// `transient` failing on a would-be-normal start) child is left out
    /// of the roster and the rest still come up.
    async fn start_all(&mut self) -> Result<Vec<ChildRuntime>, String> {
        let mut runtimes = Vec::with_capacity(self.specs.len());
        for index in 0..self.specs.len() {
            let mut runtime = ChildRuntime {
                spec_index: index,
                process: None,
                monitor_id: None,
            };
            match self.start_one(index).await {
                Ok(process) => {
                    runtime.process = Some(process);
                    self.monitor_child(index, &mut runtime);
                }
                Err(e) => {
                    warn!("child {} failed to start: {e}", self.specs[index].id);
                    if !self.record_restart() {
                        return Err(format!(
                            "max_restarts_exceeded starting child {}",
                            self.specs[index].id
                        ));
                    }
                    if !matches!(self.specs[index].restart, RestartPolicy::Temporary) {
                        match self.start_one(index).await {
                            Ok(process) => {
                                runtime.process = Some(process);
                                self.monitor_child(index, &mut runtime);
                            }
                            Err(e2) => return Err(e2),
                        }
                    }
                }
            }
            runtimes.push(runtime);
        }
        Ok(runtimes)
    }
}

#[async_trait]
impl Behavior for SupervisorBehavior {
    type Call = SupervisorCall;
    type Cast = SupervisorCast;
    type UserInfo = ();
    type Reply = SupervisorReply;
    type State = Vec<ChildRuntime>;

    fn bind_self(&mut self, process: Arc<dyn Process>) {
        self.self_process = Some(process);
    }

    async fn init(&mut self) -> Result<Self::State, String> {
        self.start_all().await
    }

    async fn handle_call(
        &mut self,
        msg: Self::Call,
        mut state: Self::State,
    ) -> Result<(Self::Reply, Self::State), String> {
        let reply = match msg {
            SupervisorCall::Children => SupervisorReply::Children(
                state
                    .iter()
                    .map(|rt| child_info(&self.specs[rt.spec_index].id, rt))
                    .collect(),
            ),
            SupervisorCall::GetChild(id) => SupervisorReply::Child(
                state
                    .iter()
                    .find(|rt| self.specs[rt.spec_index].id == id)
                    .map(|rt| child_info(&id, rt)),
            ),
        };
        Ok((reply, state))
    }

    async fn handle_cast(&mut self, msg: Self::Cast, _state: Self::State) -> Result<Self::State, String> {
        match msg {}
    }

    async fn handle_info(
        &mut self,
        msg: Info<()>,
        mut state: Self::State,
    ) -> Result<Self::State, String> {
        let Info::Down { monitor_id, reason, .. } = msg else {
            return Ok(state);
        };
        let Some(&crashed_index) = self.monitor_index.get(&monitor_id) else {
            return Ok(state);
        };
        self.monitor_index.remove(&monitor_id);

        let restart_policy = self.specs[crashed_index].restart;
        if !restart_policy.restarts_on(&reason) {
            if let Some(rt) = state.iter_mut().find(|rt| rt.spec_index == crashed_index) {
                rt.process = None;
                rt.monitor_id = None;
            }
            debug!(
                "child {} exited ({reason}), not restarting",
                self.specs[crashed_index].id
            );
            return Ok(state);
        }

        if !self.record_restart() {
            return Err("max_restarts_exceeded".to_string());
        }

        let affected: Vec<usize> = match self.strategy {
            Strategy::OneForOne => vec![crashed_index],
            Strategy::OneForAll => (0..self.specs.len()).collect(),
            Strategy::RestForOne => (crashed_index..self.specs.len()).collect(),
        };

        // Stop the still-running affected siblings in reverse order; the
        // crashed child is already dead.
        for &index in affected.iter().rev() {
            if index == crashed_index {
                continue;
            }
            if let Some(rt) = state.iter().find(|rt| rt.spec_index == index) {
                self.stop_child(rt).await;
            }
        }
        for &index in &affected {
            if let Some(rt) = state.iter_mut().find(|rt| rt.spec_index == index) {
                if let Some(monitor_id) = rt.monitor_id.take() {
                    self.monitor_index.remove(&monitor_id);
                }
                rt.process = None;
            }
        }

        // A restart attempt that fails to `init` is just another crash of
        // that child: re-queue it against the same sliding intensity
        // window rather than cascading into terminating the supervisor on
        // the first failed attempt. The window itself (`record_restart`)
        // is what eventually ends this loop.
        for &index in &affected {
            loop {
                match self.start_one(index).await {
                    Ok(process) => {
                        if let Some(rt) = state.iter_mut().find(|rt| rt.spec_index == index) {
                            rt.process = Some(process);
                            self.monitor_child(index, rt);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("child {} failed to restart: {e}", self.specs[index].id);
                        if !self.record_restart() {
                            return Err(format!("max_restarts_exceeded restarting child {}", self.specs[index].id));
                        }
                    }
                }
            }
        }

        Ok(state)
    }

    async fn terminate(&mut self, _reason: &ExitReason, state: &Self::State) {
        for runtime in state.iter().rev() {
            self.stop_child(runtime).await;
        }
    }
}

fn child_info(id: &str, rt: &ChildRuntime) -> ChildInfo {
    ChildInfo {
        id: id.to_string(),
        process_ref: rt.process.as_ref().map(|p| Ref::local(p.id().to_string())),
        running: rt.process.as_ref().is_some_and(|p| p.is_running()),
    }
}

/// A running supervisor. Thin wrapper over
/// `Handle<SupervisorBehavior>` that exposes the spec's `children`/
/// `get_child` operations with their own reply type instead of the raw
/// `SupervisorReply` enum.
pub struct Supervisor {
    handle: actormesh_process::Handle<SupervisorBehavior>,
}

impl Supervisor {
    pub async fn start(spec: SupervisorSpec) -> Result<Self, ProcessError> {
        let behavior = SupervisorBehavior::new(spec);
        let handle = actormesh_process::start(
            behavior,
            StartOpts {
                trap_exit: true,
                ..Default::default()
            },
        )
        .await?;
        Ok(Supervisor { handle })
    }

    pub fn process_ref(&self) -> Ref {
        self.handle.process_ref()
    }

    pub fn as_process(&self) -> Arc<dyn Process> {
        self.handle.as_process()
    }

    pub async fn children(&self) -> Result<Vec<ChildInfo>, ProcessError> {
        match self
            .handle
            .call(SupervisorCall::Children, Duration::from_secs(5))
            .await?
        {
            SupervisorReply::Children(children) => Ok(children),
            _ => unreachable!(),
        }
    }

    pub async fn get_child(&self, id: impl Into<String>) -> Result<Option<ChildInfo>, ProcessError> {
        match self
            .handle
            .call(SupervisorCall::GetChild(id.into()), Duration::from_secs(5))
            .await?
        {
            SupervisorReply::Child(child) => Ok(child),
            _ => unreachable!(),
        }
    }

    pub async fn stop(&self, shutdown_timeout: Duration) {
        self.handle.stop(ExitReason::Shutdown, shutdown_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actormesh_process::{Behavior as _, Handle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter;

    #[async_trait]
    impl Behavior for Counter {
        type Call = ();
        type Cast = bool; // true = crash
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

        async fn handle_cast(&mut self, crash: bool, state: Self::State) -> Result<Self::State, String> {
            if crash {
                return Err("boom".to_string());
            }
            Ok(state + 1)
        }
    }

    /// Records every `Handle<Counter>` a `ChildSpec` factory has ever
    /// started, so tests can crash the *current* instance directly
    /// without going through the supervisor (which deliberately exposes
    /// no typed child handles).
    fn counter_child(id: &str, instances: Arc<std::sync::Mutex<Vec<Handle<Counter>>>>) -> ChildSpec {
        let id = id.to_string();
        ChildSpec::new(id, RestartPolicy::Permanent, move || {
            let instances = instances.clone();
            async move {
                let handle: Handle<Counter> =
                    actormesh_process::start(Counter, StartOpts::default())
                        .await
                        .map_err(|e| e.to_string())?;
                instances.lock().unwrap().push(handle.clone());
                Ok(handle.as_process())
            }
        })
    }

    #[tokio::test]
    async fn one_for_one_restarts_only_the_crashed_child() {
        let instances = Arc::new(std::sync::Mutex::new(Vec::new()));
        let spec = SupervisorSpec::new(Strategy::OneForOne, vec![counter_child("c1", instances.clone())]);
        let supervisor = Supervisor::start(spec).await.unwrap();

        let before = supervisor.get_child("c1").await.unwrap().unwrap();
        assert!(before.running);
        assert_eq!(instances.lock().unwrap().len(), 1);

        let first_instance = instances.lock().unwrap()[0].clone();
        first_instance.cast(true);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = supervisor.get_child("c1").await.unwrap().unwrap();
        assert!(after.running);
        assert_eq!(instances.lock().unwrap().len(), 2, "child should have been restarted exactly once");
        assert_ne!(before.process_ref, after.process_ref, "restart gets a fresh process id");
    }

    #[tokio::test]
    async fn intensity_window_terminates_supervisor_after_too_many_restarts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let spec = SupervisorSpec::new(
            Strategy::OneForOne,
            vec![ChildSpec::new("always-fails", RestartPolicy::Permanent, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Arc<dyn Process>, _>("boom".to_string())
                }
            })],
        )
        .intensity(Intensity {
            max_restarts: 1,
            within: Duration::from_secs(5),
        });

        let result = Supervisor::start(spec).await;
        assert!(result.is_err());
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn a_failed_restart_attempt_is_requeued_not_fatal() {
        // attempt 0: the initial start, succeeds. attempt 1: the restart
        // triggered by the crash below, fails. attempt 2: the requeued
        // retry of that same restart, succeeds.
        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt_clone = attempt.clone();
        let instances = Arc::new(std::sync::Mutex::new(Vec::new()));
        let instances_clone = instances.clone();
        let spec = SupervisorSpec::new(
            Strategy::OneForOne,
            vec![ChildSpec::new("flaky", RestartPolicy::Permanent, move || {
                let attempt = attempt_clone.clone();
                let instances = instances_clone.clone();
                async move {
                    let n = attempt.fetch_add(1, Ordering::SeqCst);
                    if n == 1 {
                        return Err::<Arc<dyn Process>, _>("transient restart failure".to_string());
                    }
                    let handle: Handle<Counter> = actormesh_process::start(Counter, StartOpts::default())
                        .await
                        .map_err(|e| e.to_string())?;
                    instances.lock().unwrap().push(handle.clone());
                    Ok(handle.as_process())
                }
            })],
        )
        .intensity(Intensity {
            max_restarts: 5,
            within: Duration::from_secs(5),
        });

        let supervisor = Supervisor::start(spec).await.unwrap();
        assert_eq!(instances.lock().unwrap().len(), 1);

        let first_instance = instances.lock().unwrap()[0].clone();
        first_instance.cast(true);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = supervisor.get_child("flaky").await.unwrap().unwrap();
        assert!(after.running, "supervisor must survive a failed restart attempt");
        assert_eq!(
            instances.lock().unwrap().len(),
            2,
            "only the attempt that actually succeeded should produce a new instance"
        );
    }
}
