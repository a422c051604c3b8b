//! actormesh: an OTP-style actor runtime with a distributed-cluster
//! transport. This crate wires `actormesh-process` (mailboxes, process
//! runtime, registry, monitors/links), `actormesh-supervisor` (restart
//! strategies) and `actormesh-distributed` (node identity, wire codec,
//! transport, membership, remote call/monitor/link/spawn) behind a single
//! [`Cluster`] handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, RwLock};

pub use actormesh_distributed as distributed;
pub use actormesh_process as process;
pub use actormesh_supervisor as supervisor;

use actormesh_distributed::{
    codec::now_ms,
    membership::{Membership, MembershipConfig, MembershipEvent},
    node::NodeId,
    remote_call::RemoteCalls,
    remote_link::RemoteLinks,
    spawn::{BehaviorRegistry, RemoteSpawn},
    transport::{Transport, TransportConfig, TransportEvent},
    value::Value,
    ClusterError, Envelope,
};

/// Validated configuration for [`Cluster::start`].
#[derive(Clone)]
pub struct ClusterConfig {
    pub local_node: NodeId,
    pub bind_addr: String,
    pub cluster_secret: Option<Vec<u8>>,
    pub require_signature: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub reconnect_base_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub default_call_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(local_node: NodeId, bind_addr: impl Into<String>) -> Self {
        ClusterConfig {
            local_node,
            bind_addr: bind_addr.into(),
            cluster_secret: None,
            require_signature: false,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_miss_threshold: 3,
            reconnect_base_backoff: Duration::from_millis(200),
            reconnect_max_backoff: Duration::from_secs(30),
            default_call_timeout: Duration::from_secs(5),
        }
    }

    fn validate(&self) -> Result<(), ClusterError> {
        if self.bind_addr.is_empty() {
            return Err(ClusterError::InvalidClusterConfig("bind_addr must not be empty".to_string()));
        }
        if self.require_signature && self.cluster_secret.is_none() {
            return Err(ClusterError::InvalidClusterConfig(
                "require_signature is set but no cluster_secret was provided".to_string(),
            ));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(ClusterError::InvalidClusterConfig(
                "heartbeat_miss_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterStatus {
    Running,
    Stopped,
}

/// A user-facing callback fired from the cluster's event loop on node
/// up/down transitions. Held behind `Arc` so it can be cloned into the
/// loop task.
pub type NodeCallback = Arc<dyn Fn(NodeId) + Send + Sync>;

struct Callbacks {
    on_node_up: RwLock<Vec<NodeCallback>>,
    on_node_down: RwLock<Vec<NodeCallback>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            on_node_up: RwLock::new(Vec::new()),
            on_node_down: RwLock::new(Vec::new()),
        }
    }
}

/// The cluster-wide facade: owns the transport, membership table and the
/// remote call/link/spawn protocol handlers for one node.
pub struct Cluster {
    config: ClusterConfig,
    running: AtomicBool,
    bound_addr: std::net::SocketAddr,
    transport: Arc<Transport>,
    membership: Arc<Membership>,
    remote_calls: Arc<RemoteCalls>,
    remote_links: Arc<RemoteLinks>,
    remote_spawn: Arc<RemoteSpawn>,
    callbacks: Arc<Callbacks>,
}

impl Cluster {
    /// Validates `config`, binds the listener and starts the background
    /// event loop that feeds transport messages into membership, remote
    /// calls, remote links and remote spawn.
    pub async fn start(config: ClusterConfig) -> Result<Arc<Self>, ClusterError> {
        config.validate()?;

        let transport_config = TransportConfig {
            secret: config.cluster_secret.clone(),
            require_signature: config.require_signature,
            connection: actormesh_distributed::connection::ConnectionConfig {
                base_backoff: config.reconnect_base_backoff,
                max_backoff: config.reconnect_max_backoff,
                ..Default::default()
            },
        };
        let (transport, mut events) = Transport::new(config.local_node.clone(), transport_config);
        let bound_addr = transport.listen(&config.bind_addr).await?;
        info!("actormesh node {} listening on {bound_addr}", config.local_node);

        let membership_config = MembershipConfig {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_miss_threshold: config.heartbeat_miss_threshold,
        };
        let (membership, mut membership_events) = Membership::new(config.local_node.clone(), membership_config);

        let remote_calls = RemoteCalls::new(config.local_node.clone(), Arc::clone(&transport));
        let remote_links = RemoteLinks::new(config.local_node.clone(), Arc::clone(&transport));
        let remote_spawn = RemoteSpawn::new(
            config.local_node.clone(),
            Arc::clone(&transport),
            Arc::new(BehaviorRegistry::new()),
        );

        let cluster = Arc::new(Cluster {
            config,
            running: AtomicBool::new(true),
            bound_addr,
            transport,
            membership,
            remote_calls,
            remote_links,
            remote_spawn,
            callbacks: Arc::new(Callbacks::default()),
        });

        let dispatch = Arc::clone(&cluster);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch.handle_transport_event(event).await;
            }
        });

        let notify = Arc::clone(&cluster);
        tokio::spawn(async move {
            while let Some(event) = membership_events.recv().await {
                notify.handle_membership_event(event).await;
            }
        });

        let heartbeat = Arc::clone(&cluster);
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        Ok(cluster)
    }

    /// Broadcasts a `heartbeat` envelope to every connected peer every
    /// `heartbeat_interval` (spec §4.10: driven by the owning cluster, not
    /// by membership itself). Receivers fold it into membership through the
    /// same generic "any inbound message refreshes the sender" path every
    /// other message kind already takes.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let known_nodes: Vec<Value> = self
                .membership
                .members()
                .await
                .into_iter()
                .map(|e| Value::String(e.node_id.as_str().to_string()))
                .collect();
            let payload = Value::Object(vec![
                ("kind".to_string(), Value::String("heartbeat".to_string())),
                ("known_nodes".to_string(), Value::Array(known_nodes)),
            ]);
            let envelope = Envelope::new(self.config.local_node.clone(), now_ms(), payload);
            self.transport.broadcast(&envelope).await;
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionEstablished(node) => {
                info!("connection established with {node}");
                self.membership.update_node(node).await;
            }
            TransportEvent::ConnectionLost(node) => {
                warn!("connection lost with {node}");
                self.remote_calls.node_down(&node).await;
                self.remote_links.node_down(&node);
                self.membership.mark_node_down(&node).await;
            }
            TransportEvent::Message { from, envelope } => {
                self.membership.update_node(from.clone()).await;
                let kind = match &envelope.payload {
                    Value::Object(fields) => fields.iter().find(|(k, _)| k == "kind").map(|(_, v)| v.clone()),
                    _ => None,
                };
                match kind {
                    Some(Value::String(k)) if k.starts_with("remote_call") || k.starts_with("remote_cast") || k == "remote_error" => {
                        self.remote_calls.dispatch_incoming(from, envelope).await;
                    }
                    Some(Value::String(k))
                        if matches!(
                            k.as_str(),
                            "monitor_request" | "monitor_ack" | "link_request" | "link_ack" | "unlink" | "demonitor" | "exit_signal"
                        ) =>
                    {
                        self.remote_links.dispatch_incoming(from, envelope).await;
                    }
                    Some(Value::String(k)) if k.starts_with("spawn_") => {
                        self.remote_spawn.dispatch_incoming(from, envelope).await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn handle_membership_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::NodeUp(node) => {
                for cb in self.callbacks.on_node_up.read().await.iter() {
                    cb(node.clone());
                }
            }
            MembershipEvent::NodeDown(node) => {
                self.remote_calls.node_down(&node).await;
                self.remote_links.node_down(&node);
                for cb in self.callbacks.on_node_down.read().await.iter() {
                    cb(node.clone());
                }
            }
            MembershipEvent::NodeRemoved(_) => {}
        }
    }

    pub fn get_local_node_id(&self) -> &NodeId {
        &self.config.local_node
    }

    /// The socket address the listener actually bound to, useful when
    /// `bind_addr` asked for an ephemeral port (`:0`).
    pub fn bound_addr(&self) -> std::net::SocketAddr {
        self.bound_addr
    }

    pub fn get_status(&self) -> ClusterStatus {
        if self.running.load(Ordering::Acquire) {
            ClusterStatus::Running
        } else {
            ClusterStatus::Stopped
        }
    }

    pub async fn on_node_up(&self, callback: NodeCallback) {
        self.callbacks.on_node_up.write().await.push(callback);
    }

    pub async fn on_node_down(&self, callback: NodeCallback) {
        self.callbacks.on_node_down.write().await.push(callback);
    }

    pub async fn connect_to(&self, node: &NodeId) -> Result<(), ClusterError> {
        self.transport.connect_to(node).await?;
        self.membership.update_node(node.clone()).await;
        Ok(())
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn remote_calls(&self) -> &Arc<RemoteCalls> {
        &self.remote_calls
    }

    pub fn remote_links(&self) -> &Arc<RemoteLinks> {
        &self.remote_links
    }

    pub fn remote_spawn(&self) -> &Arc<RemoteSpawn> {
        &self.remote_spawn
    }

    pub fn default_call_timeout(&self) -> Duration {
        self.config.default_call_timeout
    }

    /// Stops accepting new work: disconnects every peer and marks the
    /// cluster stopped. The listener itself is left bound (no `Transport`
    /// API currently tears down the accept loop), matching the
    /// `close`-not-`destroy` distinction the transport's connections draw.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for node in self.transport.connected_nodes() {
            self.membership.remove_node(&node).await;
            self.transport.disconnect(&node).await;
        }
        info!("actormesh node {} stopped", self.config.local_node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn start_rejects_require_signature_without_secret() {
        let mut config = ClusterConfig::new(node("a@127.0.0.1:0"), "127.0.0.1:0");
        config.require_signature = true;
        let result = Cluster::start(config).await;
        assert!(matches!(result, Err(ClusterError::InvalidClusterConfig(_))));
    }

    #[tokio::test]
    async fn two_clusters_connect_and_observe_node_up() {
        let config_b = ClusterConfig::new(node("b@127.0.0.1:0"), "127.0.0.1:0");
        let cluster_b = Cluster::start(config_b).await.unwrap();
        let node_b = NodeId::new("b", "127.0.0.1", cluster_b.bound_addr().port()).unwrap();

        let config_a = ClusterConfig::new(node("a@127.0.0.1:0"), "127.0.0.1:0");
        let cluster_a = Cluster::start(config_a).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        cluster_a
            .on_node_up(Arc::new(move |n: NodeId| {
                let _ = tx.send(n);
            }))
            .await;

        cluster_a.connect_to(&node_b).await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(seen, node_b);
    }
}
