//! C11 — remote call/cast (spec §4.11): correlated request/reply over the
//! transport, with per-call timeouts and aggregate stats. A local process
//! answers remote calls by registering a [`CallHandler`] under a server
//! id; nothing here assumes the caller or callee is an `actormesh-process`
//! behavior, so this layer stays usable standalone.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};

use crate::codec::Envelope;
use crate::error::ClusterError;
use crate::node::NodeId;
use crate::transport::Transport;
use crate::value::Value;

pub type CallHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct RemoteCallStats {
    pub pending_calls: u64,
    pub total_calls: u64,
    pub total_resolved: u64,
    pub total_rejected: u64,
    pub total_timed_out: u64,
    pub total_casts: u64,
}

struct PendingCall {
    node: NodeId,
    reply: oneshot::Sender<Result<Value, ClusterError>>,
}

/// Outbound correlation state plus the registry of locally-served call
/// handlers answering inbound requests.
pub struct RemoteCalls {
    local_node: NodeId,
    transport: Arc<Transport>,
    next_call_id: AtomicU64,
    pending: DashMap<String, PendingCall>,
    servers: DashMap<String, CallHandler>,
    stats: Mutex<RemoteCallStats>,
}

fn field<'a>(obj: &'a HashMap<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key)
}

fn as_object(value: &Value) -> Option<HashMap<String, Value>> {
    match value {
        Value::Object(fields) => Some(fields.iter().cloned().collect()),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn request_envelope(local: &NodeId, kind: &str, fields: Vec<(&str, Value)>) -> Value {
    let mut obj = vec![("kind".to_string(), Value::String(kind.to_string()))];
    obj.extend(fields.into_iter().map(|(k, v)| (k.to_string(), v)));
    let _ = local;
    Value::Object(obj)
}

impl RemoteCalls {
    pub fn new(local_node: NodeId, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(RemoteCalls {
            local_node,
            transport,
            next_call_id: AtomicU64::new(0),
            pending: DashMap::new(),
            servers: DashMap::new(),
            stats: Mutex::new(RemoteCallStats::default()),
        })
    }

    pub fn register_server(&self, server_id: impl Into<String>, handler: CallHandler) {
        self.servers.insert(server_id.into(), handler);
    }

    pub fn unregister_server(&self, server_id: &str) {
        self.servers.remove(server_id);
    }

    pub async fn stats(&self) -> RemoteCallStats {
        self.stats.lock().await.clone()
    }

    fn next_id(&self) -> String {
        format!("call-{}", self.next_call_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends `server_id.call(args)` to `to` and awaits its reply, bounded
    /// by `timeout`.
    pub async fn call(
        &self,
        to: NodeId,
        server_id: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ClusterError> {
        let call_id = self.next_id();
        {
            let mut stats = self.stats.lock().await;
            stats.total_calls += 1;
            stats.pending_calls += 1;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            call_id.clone(),
            PendingCall {
                node: to.clone(),
                reply: tx,
            },
        );

        let payload = request_envelope(
            &self.local_node,
            "remote_call",
            vec![
                ("call_id", Value::String(call_id.clone())),
                ("server_id", Value::String(server_id.to_string())),
                ("args", args),
            ],
        );
        let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), payload);

        if let Err(e) = self.transport.send(&to, &envelope).await {
            self.pending.remove(&call_id);
            let mut stats = self.stats.lock().await;
            stats.pending_calls -= 1;
            stats.total_rejected += 1;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                let mut stats = self.stats.lock().await;
                stats.pending_calls -= 1;
                if result.is_ok() {
                    stats.total_resolved += 1;
                } else {
                    stats.total_rejected += 1;
                }
                result
            }
            Ok(Err(_)) => {
                // sender dropped without a reply: treat as rejection, not a timeout.
                let mut stats = self.stats.lock().await;
                stats.pending_calls -= 1;
                stats.total_rejected += 1;
                Err(ClusterError::RemoteCall(format!("call {call_id} was dropped")))
            }
            Err(_) => {
                self.pending.remove(&call_id);
                let mut stats = self.stats.lock().await;
                stats.pending_calls -= 1;
                stats.total_timed_out += 1;
                Err(ClusterError::RemoteCallTimeout {
                    ref_id: call_id,
                    node_id: to,
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget: sent best-effort, no correlation and no reply.
    pub async fn cast(&self, to: NodeId, server_id: &str, args: Value) -> Result<(), ClusterError> {
        self.stats.lock().await.total_casts += 1;
        let payload = request_envelope(
            &self.local_node,
            "remote_cast",
            vec![("server_id", Value::String(server_id.to_string())), ("args", args)],
        );
        let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), payload);
        self.transport.send(&to, &envelope).await
    }

    /// Feeds one inbound envelope through the protocol. The caller (the
    /// cluster's event loop) is responsible for routing every
    /// [`crate::transport::TransportEvent::Message`] here.
    pub async fn dispatch_incoming(&self, from: NodeId, envelope: Envelope) {
        let Some(obj) = as_object(&envelope.payload) else {
            return;
        };
        let Some(kind) = field(&obj, "kind").and_then(as_string) else {
            return;
        };
        match kind.as_str() {
            "remote_call" => self.serve_call(from, obj).await,
            "remote_cast" => self.serve_cast(obj).await,
            "remote_call_reply" => self.resolve(obj, Ok(())),
            "remote_error" => self.resolve(obj, Err(())),
            _ => {}
        }
    }

    async fn serve_call(&self, from: NodeId, obj: HashMap<String, Value>) {
        let (Some(call_id), Some(server_id), Some(args)) = (
            field(&obj, "call_id").and_then(as_string),
            field(&obj, "server_id").and_then(as_string),
            field(&obj, "args").cloned(),
        ) else {
            return;
        };

        let handler = self.servers.get(&server_id).map(|h| Arc::clone(&h));
        let reply = match handler {
            None => request_envelope(
                &self.local_node,
                "remote_error",
                vec![
                    ("call_id", Value::String(call_id)),
                    ("error_kind", Value::String("server_not_running".to_string())),
                    ("error", Value::String(format!("server {server_id} is not running"))),
                ],
            ),
            Some(handler) => match handler(args).await {
                Ok(result) => request_envelope(
                    &self.local_node,
                    "remote_call_reply",
                    vec![("call_id", Value::String(call_id)), ("result", result)],
                ),
                Err(message) => request_envelope(
                    &self.local_node,
                    "remote_error",
                    vec![
                        ("call_id", Value::String(call_id)),
                        ("error_kind", Value::String("handler_error".to_string())),
                        ("error", Value::String(message)),
                    ],
                ),
            },
        };
        let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), reply);
        let _ = self.transport.send(&from, &envelope).await;
    }

    async fn serve_cast(&self, obj: HashMap<String, Value>) {
        let (Some(server_id), Some(args)) = (
            field(&obj, "server_id").and_then(as_string),
            field(&obj, "args").cloned(),
        ) else {
            return;
        };
        if let Some(handler) = self.servers.get(&server_id).map(|h| Arc::clone(&h)) {
            let _ = handler(args).await;
        }
    }

    fn resolve(&self, obj: HashMap<String, Value>, outcome: Result<(), ()>) {
        let Some(call_id) = field(&obj, "call_id").and_then(as_string) else {
            return;
        };
        let Some((_, pending)) = self.pending.remove(&call_id) else {
            return; // late or duplicate reply; no-op
        };
        let result = match outcome {
            Ok(()) => {
                let result = field(&obj, "result").cloned().unwrap_or(Value::Undefined);
                Ok(result)
            }
            Err(()) => {
                let error = field(&obj, "error").and_then(as_string).unwrap_or_default();
                let kind = field(&obj, "error_kind").and_then(as_string).unwrap_or_default();
                Err(match kind.as_str() {
                    "server_not_running" => ClusterError::RemoteServerNotRunning {
                        server_id: error,
                        node_id: pending.node.clone(),
                    },
                    "serialization_error" => ClusterError::SerializationError(error),
                    _ => ClusterError::RemoteCall(error),
                })
            }
        };
        let _ = pending.reply.send(result);
    }

    /// A peer went unreachable: every call still pending against it fails
    /// with `NodeNotReachable` rather than hanging until its own timeout.
    pub async fn node_down(&self, node: &NodeId) {
        let stuck: Vec<String> = self
            .pending
            .iter()
            .filter(|e| &e.node == node)
            .map(|e| e.key().clone())
            .collect();
        if stuck.is_empty() {
            return;
        }
        let mut stats = self.stats.lock().await;
        for call_id in stuck {
            if let Some((_, pending)) = self.pending.remove(&call_id) {
                stats.pending_calls = stats.pending_calls.saturating_sub(1);
                stats.total_rejected += 1;
                let _ = pending.reply.send(Err(ClusterError::NodeNotReachable(node.clone())));
            }
        }
    }
}
