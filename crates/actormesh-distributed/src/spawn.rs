//! C13 — remote spawn (spec §4.13): a process-wide [`BehaviorRegistry`]
//! maps a behavior name to a factory; [`RemoteSpawn`] drives the
//! request/reply/error protocol that lets one node ask another to start
//! one.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actormesh_process::{Process, Ref};
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::codec::Envelope;
use crate::error::{ClusterError, RemoteSpawnErrorKind};
use crate::node::NodeId;
use crate::transport::Transport;
use crate::value::Value;

pub type SpawnFactory =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Process>, String>> + Send>> + Send + Sync>;

/// Process-wide registry of spawnable behaviors, keyed by name. A node can
/// only be asked to remote-spawn a behavior it has registered here.
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: DashMap<String, SpawnFactory>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: SpawnFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<SpawnFactory> {
        self.factories.get(name).map(|f| Arc::clone(&f))
    }

    pub fn get_names(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }
}

fn obj(fields: Vec<(&str, Value)>) -> Value {
    Value::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn field<'a>(fields: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn field_str(fields: &[(String, Value)], key: &str) -> Option<String> {
    match field(fields, key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

struct PendingSpawn {
    node: NodeId,
    reply: oneshot::Sender<Result<Ref, ClusterError>>,
}

/// Drives remote spawns initiated from here, and answers spawn requests
/// made of us against a locally registered [`BehaviorRegistry`].
pub struct RemoteSpawn {
    local_node: NodeId,
    transport: Arc<Transport>,
    registry: Arc<BehaviorRegistry>,
    /// processes spawned here on a remote node's behalf, kept alive for as
    /// long as something might still reference them by id.
    spawned: DashMap<String, Arc<dyn Process>>,
    pending: DashMap<String, PendingSpawn>,
    next_id: AtomicU64,
}

impl RemoteSpawn {
    pub fn new(local_node: NodeId, transport: Arc<Transport>, registry: Arc<BehaviorRegistry>) -> Arc<Self> {
        Arc::new(RemoteSpawn {
            local_node,
            transport,
            registry,
            spawned: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Looks up a process this node spawned on behalf of a remote spawn
    /// request — used so local code (e.g. a supervisor) can still reach it
    /// by the id it handed back in the `spawn_reply`.
    pub fn spawned_process(&self, id: &str) -> Option<Arc<dyn Process>> {
        self.spawned.get(id).map(|e| Arc::clone(&e))
    }

    pub async fn spawn(&self, node: NodeId, behavior: &str, args: Value, timeout: Duration) -> Result<Ref, ClusterError> {
        let spawn_id = format!("spawn-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            spawn_id.clone(),
            PendingSpawn {
                node: node.clone(),
                reply: tx,
            },
        );

        let payload = obj(vec![
            ("kind", Value::String("spawn_request".to_string())),
            ("spawn_id", Value::String(spawn_id.clone())),
            ("behavior", Value::String(behavior.to_string())),
            ("args", args),
        ]);
        let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), payload);

        if let Err(e) = self.transport.send(&node, &envelope).await {
            self.pending.remove(&spawn_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&spawn_id);
                Err(ClusterError::RemoteSpawnError(RemoteSpawnErrorKind::InitFailed(
                    "spawn request was dropped".to_string(),
                )))
            }
            Err(_) => {
                self.pending.remove(&spawn_id);
                Err(ClusterError::RemoteCallTimeout {
                    ref_id: spawn_id,
                    node_id: node,
                    timeout,
                })
            }
        }
    }

    pub async fn dispatch_incoming(&self, from: NodeId, envelope: Envelope) {
        let Value::Object(fields) = &envelope.payload else { return };
        let Some(kind) = field_str(fields, "kind") else { return };
        match kind.as_str() {
            "spawn_request" => self.serve_spawn_request(from, fields.clone()).await,
            "spawn_reply" => self.resolve_reply(fields),
            "spawn_error" => self.resolve_error(fields),
            _ => {}
        }
    }

    async fn serve_spawn_request(&self, from: NodeId, fields: Vec<(String, Value)>) {
        let (Some(spawn_id), Some(behavior), Some(args)) = (
            field_str(&fields, "spawn_id"),
            field_str(&fields, "behavior"),
            field(&fields, "args").cloned(),
        ) else {
            return;
        };

        let Some(factory) = self.registry.get(&behavior) else {
            self.reply_error(&from, &spawn_id, RemoteSpawnErrorKind::BehaviorNotFound(behavior)).await;
            return;
        };

        match factory(args).await {
            Ok(process) => {
                let process_id = process.id().to_string();
                self.spawned.insert(process_id.clone(), process);
                let payload = obj(vec![
                    ("kind", Value::String("spawn_reply".to_string())),
                    ("spawn_id", Value::String(spawn_id)),
                    ("process_id", Value::String(process_id)),
                ]);
                let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), payload);
                let _ = self.transport.send(&from, &envelope).await;
            }
            Err(message) => {
                self.reply_error(&from, &spawn_id, RemoteSpawnErrorKind::InitFailed(message)).await;
            }
        }
    }

    async fn reply_error(&self, to: &NodeId, spawn_id: &str, kind: RemoteSpawnErrorKind) {
        let (kind_str, message) = match &kind {
            RemoteSpawnErrorKind::BehaviorNotFound(name) => ("behavior_not_found", name.clone()),
            RemoteSpawnErrorKind::InitFailed(msg) => ("init_failed", msg.clone()),
        };
        let payload = obj(vec![
            ("kind", Value::String("spawn_error".to_string())),
            ("spawn_id", Value::String(spawn_id.to_string())),
            ("error_kind", Value::String(kind_str.to_string())),
            ("message", Value::String(message)),
        ]);
        let envelope = Envelope::new(self.local_node.clone(), crate::codec::now_ms(), payload);
        let _ = self.transport.send(to, &envelope).await;
    }

    fn resolve_reply(&self, fields: &[(String, Value)]) {
        let (Some(spawn_id), Some(process_id)) = (field_str(fields, "spawn_id"), field_str(fields, "process_id")) else {
            return;
        };
        if let Some((_, pending)) = self.pending.remove(&spawn_id) {
            let process_ref = Ref::remote(process_id, pending.node.as_str().to_string());
            let _ = pending.reply.send(Ok(process_ref));
        }
    }

    fn resolve_error(&self, fields: &[(String, Value)]) {
        let Some(spawn_id) = field_str(fields, "spawn_id") else { return };
        let Some((_, pending)) = self.pending.remove(&spawn_id) else { return };
        let error_kind = field_str(fields, "error_kind").unwrap_or_default();
        let message = field_str(fields, "message").unwrap_or_default();
        let kind = match error_kind.as_str() {
            "behavior_not_found" => RemoteSpawnErrorKind::BehaviorNotFound(message),
            _ => RemoteSpawnErrorKind::InitFailed(message),
        };
        let _ = pending.reply.send(Err(ClusterError::RemoteSpawnError(kind)));
    }
}
