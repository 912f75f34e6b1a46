//! In-memory transport and discovery for tests.
//!
//! [`MockConnector`] hands out connected [`MockPeer`]s: tests push server
//! frames through the peer and read back what the session wrote.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::api::{DanmuInfo, RoomDiscovery};
use crate::codec::{Operation, ProtocolVersion, encode_packet};
use crate::error::{BliveError, Result};
use crate::transport::{Connector, FrameSink, FrameStream};

/// Server notification frame carrying `message` (uncompressed).
pub fn notification_frame(message: &Value) -> Bytes {
    let body = serde_json::to_vec(message).unwrap_or_default();
    encode_packet(Operation::Notification, ProtocolVersion::Plain, 0, &body)
}

/// Auth reply frame with the given result `code`.
pub fn auth_reply_frame(code: i64) -> Bytes {
    let body = json!({ "code": code }).to_string();
    encode_packet(Operation::AuthReply, ProtocolVersion::Control, 1, body.as_bytes())
}

/// Heartbeat reply frame carrying `popularity`.
pub fn heartbeat_reply_frame(popularity: u32) -> Bytes {
    encode_packet(
        Operation::HeartbeatReply,
        ProtocolVersion::Control,
        1,
        &popularity.to_be_bytes(),
    )
}

#[derive(Debug, Clone, Copy)]
enum SendBehavior {
    Deliver,
    FailAfter(usize),
    StallAfter(usize, Duration),
}

/// Server side of one mock connection.
#[derive(Debug)]
pub struct MockPeer {
    pub url: String,
    inbound: mpsc::UnboundedSender<Bytes>,
    sent: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl MockPeer {
    /// Deliver a frame to the client.
    pub fn push(&self, frame: Bytes) {
        let _ = self.inbound.send(frame);
    }

    /// Close the connection from the server side.
    pub fn hang_up(self) {}

    /// Next frame written by the client; `None` once the client side is gone.
    pub async fn next_sent(&mut self) -> Option<Bytes> {
        self.sent.recv().await
    }

    /// Whether the client closed its write half.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockSink {
    sent: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
    behavior: SendBehavior,
    count: usize,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BliveError::transport("mock connection closed"));
        }
        self.count += 1;
        match self.behavior {
            SendBehavior::FailAfter(n) if self.count > n => {
                return Err(BliveError::transport("mock write failed"));
            }
            SendBehavior::StallAfter(n, delay) if self.count > n => {
                tokio::time::sleep(delay).await;
            }
            _ => {}
        }
        let _ = self.sent.send(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStream {
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        self.inbound.recv().await.map(Ok)
    }
}

/// [`Connector`] producing in-memory connections.
pub struct MockConnector {
    refused: Vec<String>,
    hanging: Vec<String>,
    behavior: SendBehavior,
    attempts: AtomicUsize,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            refused: Vec::new(),
            hanging: Vec::new(),
            behavior: SendBehavior::Deliver,
            attempts: AtomicUsize::new(0),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `url`.
    pub fn refuse(mut self, url: impl Into<String>) -> Self {
        self.refused.push(url.into());
        self
    }

    /// Connections to `url` never complete the handshake.
    pub fn hang(mut self, url: impl Into<String>) -> Self {
        self.hanging.push(url.into());
        self
    }

    /// The first `n` writes of every connection succeed, later ones fail.
    pub fn fail_sends_after(mut self, n: usize) -> Self {
        self.behavior = SendBehavior::FailAfter(n);
        self
    }

    /// The first `n` writes of every connection succeed, later ones hang for
    /// `delay` first.
    pub fn stall_sends_after(mut self, n: usize, delay: Duration) -> Self {
        self.behavior = SendBehavior::StallAfter(n, delay);
        self
    }

    /// Number of connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted connection.
    pub async fn next_peer(&self) -> MockPeer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refused.iter().any(|u| u == url) {
            return Err(BliveError::transport(format!("connection to {url} refused")));
        }
        if self.hanging.iter().any(|u| u == url) {
            futures::future::pending::<()>().await;
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let _ = self.peers_tx.send(MockPeer {
            url: url.to_string(),
            inbound: inbound_tx,
            sent: sent_rx,
            closed: closed.clone(),
        });

        Ok((
            Box::new(MockSink {
                sent: sent_tx,
                closed,
                behavior: self.behavior,
                count: 0,
            }),
            Box::new(MockStream { inbound: inbound_rx }),
        ))
    }
}

/// [`RoomDiscovery`] answering from memory.
pub struct MockDiscovery {
    endpoints: Vec<String>,
    users: FxHashMap<u64, u64>,
    live: AtomicBool,
    status_error: AtomicBool,
    resolves: AtomicUsize,
    polls: AtomicUsize,
    auth_payload: Bytes,
}

impl MockDiscovery {
    /// Discovery returning `endpoints` for every room. An empty list makes
    /// `resolve` fail like an unknown room.
    pub fn new(endpoints: Vec<String>) -> Self {
        let auth_payload = json!({
            "uid": 0,
            "roomid": 0,
            "protover": 3,
            "platform": "web",
            "type": 2,
            "key": "mock-token",
        })
        .to_string();
        Self {
            endpoints,
            users: FxHashMap::default(),
            live: AtomicBool::new(false),
            status_error: AtomicBool::new(false),
            resolves: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            auth_payload: Bytes::from(auth_payload),
        }
    }

    /// Map broadcaster `uid` to `room_id`.
    pub fn with_user(mut self, uid: u64, room_id: u64) -> Self {
        self.users.insert(uid, room_id);
        self
    }

    pub fn auth_payload(&self) -> Bytes {
        self.auth_payload.clone()
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    /// Make `room_status` fail.
    pub fn fail_status(&self, fail: bool) {
        self.status_error.store(fail, Ordering::SeqCst);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoomDiscovery for MockDiscovery {
    async fn resolve(&self, room_id: u64) -> Result<DanmuInfo> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.endpoints.is_empty() {
            return Err(BliveError::discovery(format!("room {room_id} not found")));
        }
        Ok(DanmuInfo {
            endpoints: self.endpoints.clone(),
            auth_payload: self.auth_payload.clone(),
        })
    }

    async fn resolve_room_from_user(&self, uid: u64) -> Result<u64> {
        self.users
            .get(&uid)
            .copied()
            .ok_or_else(|| BliveError::discovery(format!("user {uid} has no live room")))
    }

    async fn room_status(&self, _room_id: u64) -> Result<bool> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.status_error.load(Ordering::SeqCst) {
            return Err(BliveError::other("mock status error"));
        }
        Ok(self.live.load(Ordering::SeqCst))
    }
}
