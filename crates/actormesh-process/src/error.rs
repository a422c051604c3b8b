use std::time::Duration;

/// Why a process stopped running. Mirrors spec §3's process status/reason
/// model; `NoConnection` is the synthetic reason a monitor/link observes
/// when the peer's node becomes unreachable (spec §4.12).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExitReason {
    Normal,
    Shutdown,
    Error(String),
    NoConnection,
}

impl ExitReason {
    /// Links and normal termination: normal does not propagate through
    /// links (spec §4.4) — everything else does.
    pub fn propagates_through_links(&self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Error(e) => write!(f, "error: {e}"),
            ExitReason::NoConnection => write!(f, "noconnection"),
        }
    }
}

/// Public error taxonomy for process-runtime operations (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process {0} has terminated: {1}")]
    ProcessTerminated(String, ExitReason),
    #[error("call to {ref_id} timed out after {timeout:?}")]
    CallTimeout { ref_id: String, timeout: Duration },
    #[error("init failed: {0}")]
    InitError(String),
    #[error("mailbox closed")]
    MailboxClosed,
}
