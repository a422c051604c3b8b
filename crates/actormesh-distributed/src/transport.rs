//! C9 — transport (spec §4.9): a listener plus a `NodeId -> Connection`
//! map. An inbound socket sits in a pending, unbound state until its first
//! envelope tells us who dialed in.

use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::codec::{decode_frames, Envelope};
use crate::connection::{Connection, ConnectionConfig, ConnectionState};
use crate::error::ClusterError;
use crate::node::NodeId;

#[derive(Debug)]
pub enum TransportEvent {
    ConnectionEstablished(NodeId),
    ConnectionLost(NodeId),
    Message { from: NodeId, envelope: Envelope },
}

pub struct TransportConfig {
    pub secret: Option<Vec<u8>>,
    pub require_signature: bool,
    pub connection: ConnectionConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            secret: None,
            require_signature: false,
            connection: ConnectionConfig::default(),
        }
    }
}

pub struct Transport {
    local_node: NodeId,
    config: TransportConfig,
    connections: DashMap<NodeId, Arc<Connection>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    pub fn new(local_node: NodeId, config: TransportConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport {
            local_node,
            config,
            connections: DashMap::new(),
            events_tx,
        });
        (transport, events_rx)
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub async fn listen(self: &Arc<Self>, bind_addr: &str) -> Result<std::net::SocketAddr, ClusterError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::InvalidClusterConfig(format!("bind {bind_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ClusterError::InvalidClusterConfig(e.to_string()))?;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop(listener).await });
        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.handle_accepted(stream).await });
        }
    }

    /// Reads off the pending socket until the first complete frame
    /// arrives, uses its `from` field to bind the connection, then hands
    /// the rest of the socket's lifetime to a regular [`Connection`].
    async fn handle_accepted(self: Arc<Self>, stream: TcpStream) {
        let (mut read_half, write_half) = stream.into_split();
        let mut pending = BytesMut::new();
        let mut chunk = [0u8; 64 * 1024];

        let first_frame = loop {
            let frames = match decode_frames(&mut pending) {
                Ok(frames) => frames,
                Err(_) => return,
            };
            if let Some(frame) = frames.into_iter().next() {
                break frame;
            }
            match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
            }
        };

        let Ok(envelope) = Envelope::from_bytes(&first_frame) else {
            return;
        };
        let from = envelope.from.clone();
        if from == self.local_node {
            return; // self-connection, reject as a no-op
        }
        if let Some(secret) = &self.config.secret {
            if !envelope.verify(secret, self.config.require_signature) {
                return;
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(from.clone(), self.config.connection.clone(), inbound_tx);
        connection.bind_accepted(write_half, read_half, pending).await;
        self.connections.insert(from.clone(), Arc::clone(&connection));
        let _ = self.events_tx.send(TransportEvent::ConnectionEstablished(from.clone()));

        let _ = self.events_tx.send(TransportEvent::Message { from: from.clone(), envelope });
        self.spawn_forwarder(from, inbound_rx);
    }

    fn spawn_forwarder(self: &Arc<Self>, from: NodeId, mut inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(bytes) = inbound_rx.recv().await {
                let Ok(envelope) = Envelope::from_bytes(&bytes) else {
                    continue;
                };
                if let Some(secret) = &this.config.secret {
                    if !envelope.verify(secret, this.config.require_signature) {
                        continue;
                    }
                }
                let _ = this.events_tx.send(TransportEvent::Message {
                    from: from.clone(),
                    envelope,
                });
            }
            if this.connections.remove(&from).is_some() {
                let _ = this.events_tx.send(TransportEvent::ConnectionLost(from));
            }
        });
    }

    /// Dials `node`. Idempotent: a no-op if already connected.
    pub async fn connect_to(self: &Arc<Self>, node: &NodeId) -> Result<(), ClusterError> {
        if node == &self.local_node {
            return Err(ClusterError::InvalidClusterConfig("refusing to connect to self".to_string()));
        }
        if let Some(existing) = self.connections.get(node) {
            if existing.state().await == ConnectionState::Connected {
                return Ok(());
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(node.clone(), self.config.connection.clone(), inbound_tx);
        connection.connect().await?;
        self.connections.insert(node.clone(), Arc::clone(&connection));
        let _ = self.events_tx.send(TransportEvent::ConnectionEstablished(node.clone()));
        self.spawn_forwarder(node.clone(), inbound_rx);
        Ok(())
    }

    pub async fn send(&self, to: &NodeId, envelope: &Envelope) -> Result<(), ClusterError> {
        let connection = self
            .connections
            .get(to)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| ClusterError::NodeNotReachable(to.clone()))?;
        let bytes = self.encode_outgoing(envelope)?;
        connection.send(&bytes).await
    }

    /// Signs with our own secret (if configured) before serializing — every
    /// other crate builds envelopes without ever calling `sign` itself.
    fn encode_outgoing(&self, envelope: &Envelope) -> Result<Vec<u8>, ClusterError> {
        match &self.config.secret {
            Some(secret) => {
                let mut signed = envelope.clone();
                signed.sign(secret);
                signed.to_bytes()
            }
            None => envelope.to_bytes(),
        }
    }

    /// Best-effort fan-out to every currently connected node. Returns how
    /// many sends succeeded.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let targets: Vec<NodeId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut sent = 0;
        for node in targets {
            if self.send(&node, envelope).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub async fn disconnect(&self, node: &NodeId) {
        if let Some((_, connection)) = self.connections.remove(node) {
            connection.close().await;
        }
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn envelope(from: &NodeId) -> Envelope {
        Envelope::new(from.clone(), 0, Value::String("hi".to_string()))
    }

    #[tokio::test]
    async fn connect_send_and_receive_roundtrip() {
        let node_a = NodeId::parse("a@127.0.0.1:0").unwrap();
        let (transport_b, mut events_b) = Transport::new(NodeId::parse("b@127.0.0.1:0").unwrap(), TransportConfig::default());
        let addr = transport_b.listen("127.0.0.1:0").await.unwrap();

        let node_b_real = NodeId::new("b", "127.0.0.1", addr.port()).unwrap();
        let (transport_a, mut events_a) = Transport::new(node_a.clone(), TransportConfig::default());
        transport_a.connect_to(&node_b_real).await.unwrap();

        transport_a.send(&node_b_real, &envelope(&node_a)).await.unwrap();

        let event = events_b.recv().await.unwrap();
        match event {
            TransportEvent::ConnectionEstablished(_) => {
                let event = events_b.recv().await.unwrap();
                assert!(matches!(event, TransportEvent::Message { .. }));
            }
            TransportEvent::Message { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        let established = events_a.recv().await.unwrap();
        assert!(matches!(established, TransportEvent::ConnectionEstablished(_)));
    }

    #[tokio::test]
    async fn send_without_connection_is_node_not_reachable() {
        let (transport, _events) = Transport::new(NodeId::parse("a@127.0.0.1:1").unwrap(), TransportConfig::default());
        let target = NodeId::parse("b@127.0.0.1:2").unwrap();
        let result = transport.send(&target, &envelope(&target)).await;
        assert!(matches!(result, Err(ClusterError::NodeNotReachable(_))));
    }
}
