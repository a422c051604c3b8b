//! Cluster-facing error taxonomy (spec §7) not already covered by
//! [`actormesh_process::ProcessError`].

use std::time::Duration;

use crate::node::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("node {0} is not reachable")]
    NodeNotReachable(NodeId),
    #[error("cluster has not been started")]
    ClusterNotStarted,
    #[error("invalid cluster config: {0}")]
    InvalidClusterConfig(String),
    #[error("serialization error during {0}")]
    SerializationError(String),
    #[error("message signature is invalid")]
    MessageSignatureInvalid,
    #[error("remote server {server_id} is not running on {node_id}")]
    RemoteServerNotRunning { server_id: String, node_id: NodeId },
    #[error("remote spawn failed: {0}")]
    RemoteSpawnError(RemoteSpawnErrorKind),
    #[error("supervisor {child_id} exceeded its restart intensity ({limit} within {window:?})")]
    SupervisorMaxRestartsExceeded {
        child_id: String,
        window: Duration,
        limit: usize,
    },
    #[error("remote call failed: {0}")]
    RemoteCall(String),
    #[error("remote call {ref_id} to {node_id} timed out after {timeout:?}")]
    RemoteCallTimeout {
        ref_id: String,
        node_id: NodeId,
        timeout: Duration,
    },
    #[error("remote monitor {monitor_id} on {node_id} timed out waiting for an ack")]
    MonitorTimeout { monitor_id: String, node_id: NodeId },
    #[error("remote link {link_id} on {node_id} timed out waiting for an ack")]
    LinkTimeout { link_id: String, node_id: NodeId },
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RemoteSpawnErrorKind {
    #[error("behavior {0:?} is not registered")]
    BehaviorNotFound(String),
    #[error("remote init failed: {0}")]
    InitFailed(String),
}
