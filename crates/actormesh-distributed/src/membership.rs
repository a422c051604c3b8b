//! C10 — cluster membership (spec §4.10): a map of known peers and a
//! purely timer-based failure detector. A node is marked down only because
//! its heartbeat timer expired or it was told so explicitly — there is no
//! liveness probing here, that is [`crate::remote_call`]'s business.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::node::NodeId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MembershipStatus {
    Up,
    Down,
}

#[derive(Clone, Debug)]
pub struct MembershipEntry {
    pub node_id: NodeId,
    pub status: MembershipStatus,
    pub joined_at: Instant,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone)]
pub enum MembershipEvent {
    NodeUp(NodeId),
    NodeDown(NodeId),
    NodeRemoved(NodeId),
}

#[derive(Clone, Debug)]
pub struct MembershipConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_miss_threshold: 3,
        }
    }
}

impl MembershipConfig {
    fn failure_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_threshold
    }
}

pub struct Membership {
    local_node: NodeId,
    config: MembershipConfig,
    entries: RwLock<HashMap<NodeId, MembershipEntry>>,
    events_tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl Membership {
    pub fn new(local_node: NodeId, config: MembershipConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let membership = Arc::new(Membership {
            local_node,
            config,
            entries: RwLock::new(HashMap::new()),
            events_tx,
        });
        let watcher = Arc::clone(&membership);
        tokio::spawn(async move { watcher.detect_failures_loop().await });
        (membership, events_rx)
    }

    /// Records a fresh heartbeat from `node`, adding it as `Up` if unseen
    /// and flipping it back to `Up` (with a fresh timer) if it had timed
    /// out. Self-heartbeats are ignored; the local node is never a member
    /// of its own membership map.
    pub async fn update_node(&self, node: NodeId) {
        if node == self.local_node {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let was_down = entries.get(&node).map(|e| e.status == MembershipStatus::Down).unwrap_or(true);
        entries
            .entry(node.clone())
            .and_modify(|e| {
                e.last_heartbeat = now;
                e.status = MembershipStatus::Up;
            })
            .or_insert(MembershipEntry {
                node_id: node.clone(),
                status: MembershipStatus::Up,
                joined_at: now,
                last_heartbeat: now,
            });
        drop(entries);
        if was_down {
            let _ = self.events_tx.send(MembershipEvent::NodeUp(node));
        }
    }

    pub async fn mark_node_down(&self, node: &NodeId) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(node) {
            if entry.status == MembershipStatus::Up {
                entry.status = MembershipStatus::Down;
                drop(entries);
                let _ = self.events_tx.send(MembershipEvent::NodeDown(node.clone()));
            }
        }
    }

    pub async fn remove_node(&self, node: &NodeId) {
        let removed = self.entries.write().await.remove(node).is_some();
        if removed {
            let _ = self.events_tx.send(MembershipEvent::NodeRemoved(node.clone()));
        }
    }

    pub async fn status_of(&self, node: &NodeId) -> Option<MembershipStatus> {
        self.entries.read().await.get(node).map(|e| e.status)
    }

    pub async fn members(&self) -> Vec<MembershipEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    async fn detect_failures_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            let timeout = self.config.failure_timeout();
            let now = Instant::now();
            let timed_out: Vec<NodeId> = self
                .entries
                .read()
                .await
                .values()
                .filter(|e| e.status == MembershipStatus::Up && now.duration_since(e.last_heartbeat) >= timeout)
                .map(|e| e.node_id.clone())
                .collect();
            for node in timed_out {
                self.mark_node_down(&node).await;
            }
        }
    }
}
