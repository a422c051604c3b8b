//! C8 — a single node-to-node TCP connection (spec §4.8): a small state
//! machine with jittered exponential backoff, independent of what the
//! bytes it carries mean.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;

use crate::codec::{decode_frames, encode_frame};
use crate::error::ClusterError;
use crate::node::NodeId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_sent_at: Option<Instant>,
    pub last_received_at: Option<Instant>,
    pub reconnect_attempts: u32,
    pub connected_at: Option<Instant>,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: None,
        }
    }
}

/// Jittered exponential backoff: `min(max, base * 2^attempt) * rand(0.5..1.5)`.
pub fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exp = config.base_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(config.max_backoff);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter)
}

/// A connection to one peer node. `state` and `stats` are independently
/// lockable from the write half so a reader task can update stats while a
/// caller sends.
pub struct Connection {
    pub node_id: NodeId,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    write_half: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    stats: Mutex<ConnectionStats>,
    read_buf: Mutex<BytesMut>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection {
    pub fn new(node_id: NodeId, config: ConnectionConfig, inbound: mpsc::UnboundedSender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Connection {
            node_id,
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            write_half: Mutex::new(None),
            stats: Mutex::new(ConnectionStats::default()),
            read_buf: Mutex::new(BytesMut::new()),
            inbound,
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.stats.lock().await.clone()
    }

    /// Dials out to the peer. On success spawns a background reader task
    /// that feeds complete frames into `inbound` and flips to
    /// `Disconnected` the moment the socket closes.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClusterError> {
        *self.state.write().await = ConnectionState::Connecting;
        let addr = self.node_id.socket_addr();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClusterError::NodeNotReachable(self.node_id.clone()))?
            .map_err(|_| ClusterError::NodeNotReachable(self.node_id.clone()))?;
        self.adopt(stream).await;
        Ok(())
    }

    /// Installs an already-connected socket (inbound accept, or a
    /// successful outbound dial) and starts its reader task.
    pub async fn adopt(self: &Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        self.bind_accepted(write_half, read_half, BytesMut::new()).await;
    }

    /// Like [`Connection::adopt`], but for a socket that was already split
    /// and partially read before this connection's peer identity was
    /// known (the transport's pending-socket slot): `leftover` is any
    /// bytes read off the wire before the bind, not yet decoded.
    pub async fn bind_accepted(
        self: &Arc<Self>,
        write_half: tokio::net::tcp::OwnedWriteHalf,
        read_half: tokio::net::tcp::OwnedReadHalf,
        leftover: BytesMut,
    ) {
        *self.write_half.lock().await = Some(write_half);
        *self.state.write().await = ConnectionState::Connected;
        self.stats.lock().await.connected_at = Some(Instant::now());
        *self.read_buf.lock().await = leftover;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !this.flush_decoded().await {
                this.read_loop(read_half).await;
            }
        });
    }

    /// Decodes any complete frames already sitting in `read_buf` and
    /// forwards them. Returns `true` if decoding failed (caller should not
    /// start the read loop on a connection that is already corrupt).
    async fn flush_decoded(&self) -> bool {
        let frames = {
            let mut buf = self.read_buf.lock().await;
            match decode_frames(&mut buf) {
                Ok(frames) => frames,
                Err(_) => return true,
            }
        };
        if !frames.is_empty() {
            let mut stats = self.stats.lock().await;
            stats.messages_received += frames.len() as u64;
            stats.bytes_received += frames.iter().map(|f| f.len() as u64).sum::<u64>();
            stats.last_received_at = Some(Instant::now());
            drop(stats);
            for frame in frames {
                let _ = self.inbound.send(frame);
            }
        }
        false
    }

    async fn read_loop(self: Arc<Self>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            self.read_buf.lock().await.extend_from_slice(&chunk[..n]);
            if self.flush_decoded().await {
                break;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
        *self.write_half.lock().await = None;
    }

    /// Writes one already-framed message body. Fails with
    /// [`ClusterError::NodeNotReachable`] unless currently connected.
    pub async fn send(&self, body: &[u8]) -> Result<(), ClusterError> {
        let mut framed = Vec::with_capacity(body.len() + 4);
        encode_frame(body, &mut framed)?;

        let mut guard = self.write_half.lock().await;
        let Some(write_half) = guard.as_mut() else {
            return Err(ClusterError::NodeNotReachable(self.node_id.clone()));
        };
        if write_half.write_all(&framed).await.is_err() {
            *guard = None;
            drop(guard);
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(ClusterError::NodeNotReachable(self.node_id.clone()));
        }
        drop(guard);

        let mut stats = self.stats.lock().await;
        stats.messages_sent += 1;
        stats.bytes_sent += framed.len() as u64;
        stats.last_sent_at = Some(Instant::now());
        Ok(())
    }

    /// Runs the reconnect loop with jittered backoff until connected or
    /// `max_reconnect_attempts` is exhausted.
    pub async fn reconnect_with_backoff(self: &Arc<Self>) -> Result<(), ClusterError> {
        *self.state.write().await = ConnectionState::Reconnecting;
        let mut attempt = 0u32;
        loop {
            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return Err(ClusterError::NodeNotReachable(self.node_id.clone()));
                }
            }
            tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
            self.stats.lock().await.reconnect_attempts += 1;
            if self.connect().await.is_ok() {
                return Ok(());
            }
            attempt += 1;
        }
    }

    pub async fn close(&self) {
        *self.write_half.lock().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}
