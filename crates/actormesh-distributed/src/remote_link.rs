//! C12 — remote monitor/link (spec §4.12): a three-phase protocol (request,
//! local registration + ack, eventual exit/down notification) that makes a
//! process on another node look, to [`actormesh_process::monitor`] and
//! [`actormesh_process::link`], like any other [`actormesh_process::Process`].
//!
//! [`RemoteProcess`] is the proxy object: calling `send_system` on it
//! forwards the request over the wire instead of into a local mailbox.
//! [`RemoteLinks`] is the bookkeeping shared by every proxy on a node plus
//! the inbound half of the protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::warn;
use tokio::sync::watch;

use actormesh_process::{ExitReason, Process, Ref, SystemSignal};

use crate::codec::Envelope;
use crate::error::ClusterError;
use crate::node::NodeId;
use crate::transport::Transport;
use crate::value::Value;

/// How long a `monitor_request`/`link_request` waits for its ack before the
/// watcher/peer is told the remote side never confirmed it.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Stands in, locally, for a process that actually lives on another node.
/// `role_id` is the id this proxy announces itself as in outgoing protocol
/// messages: a target/peer id for a request we're making, or the
/// monitor/link id itself when we're the ack side of a request someone
/// else made of us.
pub struct RemoteProcess {
    links: Arc<RemoteLinks>,
    node: NodeId,
    remote_id: String,
    role_id: String,
    alive: AtomicBool,
    status_tx: watch::Sender<Option<ExitReason>>,
}

impl RemoteProcess {
    fn new(links: Arc<RemoteLinks>, node: NodeId, remote_id: String, role_id: String) -> Arc<Self> {
        let (status_tx, _) = watch::channel(None);
        Arc::new(RemoteProcess {
            links,
            node,
            remote_id,
            role_id,
            alive: AtomicBool::new(true),
            status_tx,
        })
    }

    fn mark_down(&self, reason: ExitReason) {
        self.alive.store(false, Ordering::Release);
        let _ = self.status_tx.send(Some(reason));
    }
}

#[async_trait]
impl Process for RemoteProcess {
    fn id(&self) -> &str {
        &self.remote_id
    }

    fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn send_system(&self, signal: SystemSignal) {
        let links = Arc::clone(&self.links);
        let node = self.node.clone();
        let role_id = self.role_id.clone();
        match signal {
            SystemSignal::Monitor { id, watcher } => {
                links.pending_monitors.insert(id.clone(), (node.clone(), watcher));
                let send_links = Arc::clone(&links);
                let send_node = node.clone();
                let send_id = id.clone();
                tokio::spawn(async move {
                    send_links
                        .send(&send_node, "monitor_request", vec![
                            ("monitor_id", Value::String(send_id)),
                            ("target_id", Value::String(role_id)),
                        ])
                        .await;
                });
                tokio::spawn(async move {
                    tokio::time::sleep(ACK_TIMEOUT).await;
                    if let Some((_, (node, watcher))) = links.pending_monitors.remove(&id) {
                        warn!("{}", ClusterError::MonitorTimeout { monitor_id: id.clone(), node_id: node.clone() });
                        watcher.send_system(SystemSignal::ProcessDown {
                            monitor_id: id,
                            target: Ref::remote("unknown", node.as_str().to_string()),
                            reason: ExitReason::NoConnection,
                        });
                    }
                });
            }
            SystemSignal::Demonitor { id } => {
                links.pending_monitors.remove(&id);
                links.outgoing_monitors.remove(&id);
                tokio::spawn(async move {
                    links.send(&node, "demonitor", vec![("monitor_id", Value::String(id))]).await;
                });
            }
            SystemSignal::Link { id, peer } => {
                links.pending_links.insert(id.clone(), (node.clone(), peer));
                let send_links = Arc::clone(&links);
                let send_node = node.clone();
                let send_id = id.clone();
                tokio::spawn(async move {
                    send_links
                        .send(&send_node, "link_request", vec![
                            ("link_id", Value::String(send_id)),
                            ("peer_id", Value::String(role_id)),
                        ])
                        .await;
                });
                tokio::spawn(async move {
                    tokio::time::sleep(ACK_TIMEOUT).await;
                    if let Some((_, (node, peer))) = links.pending_links.remove(&id) {
                        warn!("{}", ClusterError::LinkTimeout { link_id: id.clone(), node_id: node.clone() });
                        // the local half already recorded this link optimistically
                        // (actormesh_process::links::link sends to both sides at
                        // once); unlink rolls that back instead of leaving it live
                        // with no remote counterpart.
                        peer.send_system(SystemSignal::Unlink { id });
                    }
                });
            }
            SystemSignal::Unlink { id } => {
                links.pending_links.remove(&id);
                links.outgoing_links.remove(&id);
                tokio::spawn(async move {
                    links.send(&node, "unlink", vec![("link_id", Value::String(id))]).await;
                });
            }
            SystemSignal::LinkExit { id, reason, .. } => {
                tokio::spawn(async move {
                    links
                        .send(&node, "exit_signal", vec![
                            ("role", Value::String("link".to_string())),
                            ("id", Value::String(id)),
                            ("reason", reason_to_value(&reason)),
                        ])
                        .await;
                });
            }
            SystemSignal::ProcessDown { monitor_id, reason, .. } => {
                tokio::spawn(async move {
                    links
                        .send(&node, "exit_signal", vec![
                            ("role", Value::String("monitor".to_string())),
                            ("id", Value::String(monitor_id)),
                            ("reason", reason_to_value(&reason)),
                        ])
                        .await;
                });
            }
            SystemSignal::Stop(_) => {}
        }
    }

    async fn stop(&self, reason: ExitReason, _timeout: std::time::Duration) {
        self.mark_down(reason);
    }

    async fn wait_stopped(&self) -> ExitReason {
        let mut rx = self.status_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ExitReason::NoConnection;
            }
        }
    }
}

fn reason_to_value(reason: &ExitReason) -> Value {
    Value::String(reason.to_string())
}

fn value_to_reason(value: &Value) -> ExitReason {
    match value {
        Value::String(s) if s == "normal" => ExitReason::Normal,
        Value::String(s) if s == "shutdown" => ExitReason::Shutdown,
        Value::String(s) if s == "noconnection" => ExitReason::NoConnection,
        // `ExitReason::Error`'s `Display` prepends "error: "; strip it back
        // off so a message round-trips unchanged instead of re-wrapping on
        // every hop.
        Value::String(s) => match s.strip_prefix("error: ") {
            Some(message) => ExitReason::Error(message.to_string()),
            None => ExitReason::Error(s.clone()),
        },
        _ => ExitReason::Error("malformed remote exit reason".to_string()),
    }
}

fn as_object(value: &Value) -> Option<Vec<(String, Value)>> {
    match value {
        Value::Object(fields) => Some(fields.clone()),
        _ => None,
    }
}

fn get<'a>(obj: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    obj.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn get_str(obj: &[(String, Value)], key: &str) -> Option<String> {
    match get(obj, key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Shared, per-node bookkeeping for every remote monitor/link in either
/// direction.
pub struct RemoteLinks {
    local_node: NodeId,
    transport: Arc<Transport>,
    /// Processes on this node reachable by id, so an incoming
    /// monitor/link/unlink request can find its target.
    local_processes: DashMap<String, Arc<dyn Process>>,
    /// `monitor_id -> (remote node, local watcher)`, for requests we made
    /// and the peer has acked `ok:true`.
    outgoing_monitors: DashMap<String, (NodeId, Arc<dyn Process>)>,
    /// `link_id -> (remote node, local peer)`, for requests we made and the
    /// peer has acked `ok:true`.
    outgoing_links: DashMap<String, (NodeId, Arc<dyn Process>)>,
    /// `monitor_id -> (remote node, local watcher)`, sent but not yet
    /// acked — moved to `outgoing_monitors` on `ok:true`, resolved as a
    /// rejection on `ok:false` or on [`ACK_TIMEOUT`].
    pending_monitors: DashMap<String, (NodeId, Arc<dyn Process>)>,
    /// `link_id -> (remote node, local peer)`, sent but not yet acked —
    /// moved to `outgoing_links` on `ok:true`, unwound on `ok:false` or
    /// [`ACK_TIMEOUT`].
    pending_links: DashMap<String, (NodeId, Arc<dyn Process>)>,
    /// `monitor_id -> (requesting node, local target)`, for requests a
    /// remote peer made of us.
    incoming_monitors: DashMap<String, (NodeId, Arc<dyn Process>)>,
    /// `link_id -> (requesting node, local target)`, for requests a remote
    /// peer made of us.
    incoming_links: DashMap<String, (NodeId, Arc<dyn Process>)>,
}

impl RemoteLinks {
    pub fn new(local_node: NodeId, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(RemoteLinks {
            local_node,
            transport,
            local_processes: DashMap::new(),
            outgoing_monitors: DashMap::new(),
            outgoing_links: DashMap::new(),
            pending_monitors: DashMap::new(),
            pending_links: DashMap::new(),
            incoming_monitors: DashMap::new(),
            incoming_links: DashMap::new(),
        })
    }

    pub fn register_local(&self, id: impl Into<String>, process: Arc<dyn Process>) {
        self.local_processes.insert(id.into(), process);
    }

    pub fn unregister_local(&self, id: &str) {
        self.local_processes.remove(id);
    }

    /// Every link entry this node is currently a party to, either as the
    /// side that asked for it or the side serving someone else's request.
    pub fn active_link_count(&self) -> usize {
        self.outgoing_links.len() + self.incoming_links.len()
    }

    /// A [`Process`] standing in for `remote_id@node`, passable to
    /// [`actormesh_process::monitor`] / [`actormesh_process::link`] as if
    /// it were local.
    pub fn remote_target(self: &Arc<Self>, node: NodeId, remote_id: String) -> Arc<dyn Process> {
        let role_id = remote_id.clone();
        RemoteProcess::new(Arc::clone(self), node, remote_id, role_id)
    }

    async fn send(&self, node: &NodeId, kind: &str, fields: Vec<(&str, Value)>) {
        let mut obj = vec![("kind".to_string(), Value::String(kind.to_string()))];
        obj.extend(fields.into_iter().map(|(k, v)| (k.to_string(), v)));
        let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), Value::Object(obj));
        let _ = self.transport.send(node, &envelope).await;
    }

    pub async fn dispatch_incoming(&self, from: NodeId, envelope: Envelope) {
        let Some(obj) = as_object(&envelope.payload) else { return };
        let Some(kind) = get_str(&obj, "kind") else { return };
        match kind.as_str() {
            "monitor_request" => self.serve_monitor_request(from, obj).await,
            "link_request" => self.serve_link_request(from, obj).await,
            "monitor_ack" => self.resolve_monitor_ack(obj),
            "link_ack" => self.resolve_link_ack(obj),
            "demonitor" => {
                if let Some(id) = get_str(&obj, "monitor_id") {
                    if let Some((_, (_, target))) = self.incoming_monitors.remove(&id) {
                        target.send_system(SystemSignal::Demonitor { id });
                    }
                }
            }
            "unlink" => {
                if let Some(id) = get_str(&obj, "link_id") {
                    if let Some((_, (_, target))) = self.incoming_links.remove(&id) {
                        target.send_system(SystemSignal::Unlink { id });
                    }
                }
            }
            "exit_signal" => self.serve_exit_signal(from, obj),
            _ => {}
        }
    }

    async fn serve_monitor_request(&self, from: NodeId, obj: Vec<(String, Value)>) {
        let (Some(monitor_id), Some(target_id)) = (get_str(&obj, "monitor_id"), get_str(&obj, "target_id")) else {
            return;
        };
        let Some(target) = self.local_processes.get(&target_id).map(|e| Arc::clone(&e)) else {
            self.send(&from, "monitor_ack", vec![
                ("monitor_id", Value::String(monitor_id)),
                ("ok", Value::Bool(false)),
            ])
            .await;
            return;
        };
        let watcher = self.remote_target_for(from.clone(), monitor_id.clone());
        self.incoming_monitors.insert(monitor_id.clone(), (from.clone(), target.clone()));
        target.send_system(SystemSignal::Monitor { id: monitor_id.clone(), watcher });
        self.send(&from, "monitor_ack", vec![
            ("monitor_id", Value::String(monitor_id)),
            ("ok", Value::Bool(true)),
        ])
        .await;
    }

    async fn serve_link_request(&self, from: NodeId, obj: Vec<(String, Value)>) {
        let (Some(link_id), Some(peer_id)) = (get_str(&obj, "link_id"), get_str(&obj, "peer_id")) else {
            return;
        };
        let Some(target) = self.local_processes.get(&peer_id).map(|e| Arc::clone(&e)) else {
            self.send(&from, "link_ack", vec![("link_id", Value::String(link_id)), ("ok", Value::Bool(false))])
                .await;
            return;
        };
        let peer = self.remote_target_for(from.clone(), link_id.clone());
        self.incoming_links.insert(link_id.clone(), (from.clone(), target.clone()));
        target.send_system(SystemSignal::Link { id: link_id.clone(), peer });
        self.send(&from, "link_ack", vec![("link_id", Value::String(link_id)), ("ok", Value::Bool(true))])
            .await;
    }

    /// The other side answered a `monitor_request` we made. `ok:true`
    /// promotes the entry to `outgoing_monitors` so `exit_signal`/`node_down`
    /// can find it; `ok:false` (the target doesn't exist on that node)
    /// rejects the watcher immediately instead of leaving it waiting for a
    /// `down` that will never come. A missing pending entry means the
    /// request already timed out or was demonitored — late ack, no-op.
    fn resolve_monitor_ack(&self, obj: Vec<(String, Value)>) {
        let (Some(id), Some(ok)) = (get_str(&obj, "monitor_id"), get(&obj, "ok")) else {
            return;
        };
        let Some((_, (node, watcher))) = self.pending_monitors.remove(&id) else {
            return;
        };
        if matches!(ok, Value::Bool(true)) {
            self.outgoing_monitors.insert(id, (node, watcher));
        } else {
            watcher.send_system(SystemSignal::ProcessDown {
                monitor_id: id,
                target: Ref::remote("unknown", node.as_str().to_string()),
                reason: ExitReason::NoConnection,
            });
        }
    }

    /// Mirror of [`Self::resolve_monitor_ack`] for links. On `ok:false` the
    /// local peer already believes it's linked (`link()` registers both
    /// sides before either ack arrives), so the rejection is unwound with
    /// `Unlink` rather than reported as a crash.
    fn resolve_link_ack(&self, obj: Vec<(String, Value)>) {
        let (Some(id), Some(ok)) = (get_str(&obj, "link_id"), get(&obj, "ok")) else {
            return;
        };
        let Some((_, (node, peer))) = self.pending_links.remove(&id) else {
            return;
        };
        if matches!(ok, Value::Bool(true)) {
            self.outgoing_links.insert(id, (node, peer));
        } else {
            peer.send_system(SystemSignal::Unlink { id });
        }
    }

    fn serve_exit_signal(&self, from: NodeId, obj: Vec<(String, Value)>) {
        let (Some(role), Some(id), Some(reason_value)) = (
            get_str(&obj, "role"),
            get_str(&obj, "id"),
            get(&obj, "reason").cloned(),
        ) else {
            return;
        };
        let reason = value_to_reason(&reason_value);
        match role.as_str() {
            "monitor" => {
                if let Some((_, (_, watcher))) = self.outgoing_monitors.remove(&id) {
                    watcher.send_system(SystemSignal::ProcessDown {
                        monitor_id: id,
                        target: Ref::remote("unknown", from.as_str().to_string()),
                        reason,
                    });
                }
            }
            "link" => {
                // Links are symmetric: the crash can be reported by either
                // side, so it may resolve against a link we ourselves asked
                // for (`outgoing_links`) or one a peer asked us to serve
                // (`incoming_links`), depending on which end just died.
                if let Some((_, (_, peer))) = self.outgoing_links.remove(&id) {
                    peer.send_system(SystemSignal::LinkExit {
                        id,
                        from: Ref::remote("unknown", from.as_str().to_string()),
                        reason,
                    });
                } else if let Some((_, (_, target))) = self.incoming_links.remove(&id) {
                    target.send_system(SystemSignal::LinkExit {
                        id,
                        from: Ref::remote("unknown", from.as_str().to_string()),
                        reason,
                    });
                }
            }
            _ => {}
        }
    }

    fn remote_target_for(self: &Arc<Self>, node: NodeId, role_id: String) -> Arc<dyn Process> {
        RemoteProcess::new(Arc::clone(self), node, role_id.clone(), role_id)
    }

    /// A peer node went down: every still-pending remote monitor/link
    /// against it resolves as if the peer had exited with `noconnection`
    /// (spec §4.12), instead of waiting forever for a message that will
    /// now never arrive.
    pub fn node_down(&self, node: &NodeId) {
        let monitors: Vec<String> = self
            .outgoing_monitors
            .iter()
            .chain(self.pending_monitors.iter())
            .filter(|e| &e.value().0 == node)
            .map(|e| e.key().clone())
            .collect();
        for id in monitors {
            let entry = self.outgoing_monitors.remove(&id).or_else(|| self.pending_monitors.remove(&id));
            if let Some((_, (_, watcher))) = entry {
                watcher.send_system(SystemSignal::ProcessDown {
                    monitor_id: id,
                    target: Ref::remote("unknown", node.as_str().to_string()),
                    reason: ExitReason::NoConnection,
                });
            }
        }
        let links: Vec<String> = self
            .outgoing_links
            .iter()
            .chain(self.pending_links.iter())
            .filter(|e| &e.value().0 == node)
            .map(|e| e.key().clone())
            .collect();
        for id in links {
            let entry = self.outgoing_links.remove(&id).or_else(|| self.pending_links.remove(&id));
            if let Some((_, (_, peer))) = entry {
                peer.send_system(SystemSignal::LinkExit {
                    id,
                    from: Ref::remote("unknown", node.as_str().to_string()),
                    reason: ExitReason::NoConnection,
                });
            }
        }

        // Requests the dead peer made of us: its watchers can never be told
        // we're gone since no link exists from them to notify, but a linked
        // local target (symmetric relationship) still needs its LinkExit.
        let incoming_monitor_ids: Vec<String> = self
            .incoming_monitors
            .iter()
            .filter(|e| &e.value().0 == node)
            .map(|e| e.key().clone())
            .collect();
        for id in incoming_monitor_ids {
            self.incoming_monitors.remove(&id);
        }
        let incoming_link_ids: Vec<String> = self
            .incoming_links
            .iter()
            .filter(|e| &e.value().0 == node)
            .map(|e| e.key().clone())
            .collect();
        for id in incoming_link_ids {
            if let Some((_, (_, target))) = self.incoming_links.remove(&id) {
                target.send_system(SystemSignal::LinkExit {
                    id,
                    from: Ref::remote("unknown", node.as_str().to_string()),
                    reason: ExitReason::NoConnection,
                });
            }
        }
    }
}
