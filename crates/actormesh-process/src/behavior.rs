//! The [`Behavior`] trait is this system's equivalent of the spec's
//! duck-typed callback object (`init`/`handleCall`/`handleCast`/
//! `handleInfo`/`terminate`). Rust has no optional trait methods, so the
//! "capability set" from Design Notes §9 is expressed with default
//! implementations: a behavior that never overrides `handle_info` simply
//! discards info messages, matching "if absent, discard".

use std::sync::Arc;

use async_trait::async_trait;

use crate::mailbox::Info;
use crate::{ExitReason, Process};

/// A generic-server behavior. Associated types carry the process's message
/// shapes; `State` is passed by value in and out of every callback (spec
/// §4.2: "state is not shared").
#[async_trait]
pub trait Behavior: Send + 'static {
    type Call: Send + 'static;
    type Cast: Send + 'static;
    type UserInfo: Send + 'static;
    type Reply: Send + 'static;
    type State: Send + 'static;

    /// Hands the behavior an erased handle to itself before `init` runs.
    /// Default: ignored. Override when a behavior needs to register itself
    /// as a watcher/peer for processes it starts from inside `init` —
    /// without this, that self-reference is only available after `start()`
    /// returns, which is too late for anything spawned during `init`.
    fn bind_self(&mut self, _process: Arc<dyn Process>) {}

    /// Builds the initial state. An `Err` here fails `start()` with
    /// `InitError` and the process never transitions to `running`.
    async fn init(&mut self) -> Result<Self::State, String>;

    /// Handles a synchronous call. Returning `Err` terminates the process
    /// with `{error, e}` (unless `trap_exit`) after the caller is replied to
    /// with that same error.
    async fn handle_call(
        &mut self,
        _msg: Self::Call,
        _state: Self::State,
    ) -> Result<(Self::Reply, Self::State), String> {
        Err("handle_call not implemented".to_string())
    }

    /// Handles a fire-and-forget cast.
    async fn handle_cast(
        &mut self,
        _msg: Self::Cast,
        state: Self::State,
    ) -> Result<Self::State, String> {
        Ok(state)
    }

    /// Handles a non-call/cast message — link exit signals (when
    /// `trap_exit`), monitor-down notifications, and user-defined info.
    /// Default: discard and keep the state unchanged.
    async fn handle_info(
        &mut self,
        _msg: Info<Self::UserInfo>,
        state: Self::State,
    ) -> Result<Self::State, String> {
        Ok(state)
    }

    /// Best-effort, bounded cleanup hook run once before the process
    /// finally terminates.
    async fn terminate(&mut self, _reason: &ExitReason, _state: &Self::State) {}
}
