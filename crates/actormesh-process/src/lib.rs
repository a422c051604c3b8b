//! actormesh's core process abstraction: a typed [`Behavior`] runs inside
//! an untyped [`Process`] trait object so the runtime can hold links,
//! monitors, registries and supervisors as heterogeneous collections —
//! the same erasure the teacher uses for its own `dyn Process`.

pub mod behavior;
pub mod error;
pub mod ids;
pub mod links;
pub mod mailbox;
pub mod reference;
pub mod registry;
pub mod runtime;

pub use behavior::Behavior;
pub use error::{ExitReason, ProcessError};
pub use mailbox::{Envelope, Info, Mailbox, SystemSignal};
pub use reference::Ref;
pub use registry::Registry;
pub use runtime::{link, monitor, start, Handle, LinkRef, MonitorRef, StartOpts};

/// Behavior-erased handle to a running process. Every [`Handle<B>`] (for
/// any `B: Behavior`) implements this so links, monitors, the registry and
/// supervisors never need to know a process's concrete behavior type.
#[async_trait::async_trait]
pub trait Process: Send + Sync {
    /// Stable process id (the local half of a [`Ref`]).
    fn id(&self) -> &str;

    /// Whether the process is still accepting messages.
    fn is_running(&self) -> bool;

    /// Delivers a system-level signal (link/unlink/monitor/demonitor/stop)
    /// into the process's mailbox. Silently dropped if the mailbox has
    /// already closed — the caller cannot distinguish "already dead" from
    /// "died moments ago", which matches the spec's fire-and-forget
    /// teardown signals.
    fn send_system(&self, signal: SystemSignal);

    /// Requests a graceful stop and waits up to `timeout` for it to land.
    /// The erased form supervisors use to tear down children without
    /// knowing their concrete behavior type.
    async fn stop(&self, reason: ExitReason, timeout: std::time::Duration);

    /// Waits (without requesting a stop) until the process has terminated
    /// on its own and returns why. Supervisors use this to learn about a
    /// crash without setting up the full link/monitor signal machinery.
    async fn wait_stopped(&self) -> ExitReason;
}
