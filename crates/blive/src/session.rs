//! One live-room connection: connect, authenticate, receive, heartbeat, shut down.
//!
//! A session owns three tasks:
//! - the heartbeat task, which writes a heartbeat packet every interval;
//! - the receive task, which decodes frames and dispatches their events;
//! - the supervisor, which waits for a stop request or a fatal error and tears
//!   the other two down with a bounded wait each.
//!
//! Sessions are single use. Once [`SessionState::Closed`] is reached a new
//! session has to be connected.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::api::RoomDiscovery;
use crate::codec::{self, FrameEncoder, Operation, Packet};
use crate::config::ClientConfig;
use crate::error::{BliveError, Result};
use crate::history::HistoryWriter;
use crate::registry::MessageRegistry;
use crate::transport::{Connector, FrameSink, FrameStream};

/// Lifecycle of a [`ConnectionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Live,
    Closing,
    Closed,
}

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` was called.
    Requested,
    /// Auth rejected, transport failure or server-side close.
    Failed(String),
}

/// Outcome of a session shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The heartbeat task ignored cancellation and was abandoned.
    pub heartbeat_timed_out: bool,
    /// The receive task ignored cancellation and was abandoned.
    pub receiver_timed_out: bool,
    pub reason: CloseReason,
}

/// Everything a session needs to connect.
pub struct SessionParams {
    pub room_id: u64,
    pub discovery: Arc<dyn RoomDiscovery>,
    pub connector: Arc<dyn Connector>,
    pub registry: Arc<MessageRegistry>,
    pub config: ClientConfig,
}

/// State shared between the session handle and its tasks.
struct Shared {
    room_id: u64,
    state: watch::Sender<SessionState>,
    /// Fires once the session starts closing, for whatever reason.
    closing: CancellationToken,
    reason: parking_lot::Mutex<Option<CloseReason>>,
    popularity: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn close_with(&self, reason: CloseReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closing.cancel();
    }

    fn fail(&self, reason: impl Into<String>) {
        self.close_with(CloseReason::Failed(reason.into()));
    }
}

/// Write half plus the sequence counter; locked as a unit so packets are
/// never interleaved.
struct FrameWriter {
    sink: Box<dyn FrameSink>,
    encoder: FrameEncoder,
}

impl FrameWriter {
    async fn send(&mut self, operation: Operation, payload: &[u8]) -> Result<()> {
        let frame = self.encoder.encode(operation, payload);
        self.sink.send(frame).await
    }
}

/// A connected live-room session.
pub struct ConnectionSession {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    report_rx: watch::Receiver<Option<ShutdownReport>>,
}

impl ConnectionSession {
    /// Resolve the room, open the transport, authenticate and start the
    /// heartbeat and receive tasks.
    ///
    /// Discovery and connection errors are returned to the caller. The auth
    /// reply is checked asynchronously by the receive task; a rejection closes
    /// the session.
    pub async fn connect(params: SessionParams) -> Result<Self> {
        let SessionParams {
            room_id,
            discovery,
            connector,
            registry,
            config,
        } = params;

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(Shared {
            room_id,
            state: state_tx,
            closing: CancellationToken::new(),
            reason: parking_lot::Mutex::new(None),
            popularity: AtomicU32::new(0),
        });

        let info = discovery.resolve(room_id).await?;
        let (sink, stream) = open_endpoint(connector.as_ref(), &info.endpoints, &config).await?;

        shared.set_state(SessionState::Authenticating);
        let mut writer = FrameWriter {
            sink,
            encoder: FrameEncoder::new(),
        };
        debug!(room_id, "Sending auth packet");
        if let Err(e) = writer.send(Operation::Auth, &info.auth_payload).await {
            let _ = writer.sink.close().await;
            return Err(e);
        }
        let writer = Arc::new(Mutex::new(writer));

        let heartbeat_token = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            shared.clone(),
            writer.clone(),
            heartbeat_token.clone(),
            config.heartbeat_interval(),
        ));

        let receiver_token = CancellationToken::new();
        let history = config
            .history_dir
            .as_ref()
            .map(|dir| Arc::new(HistoryWriter::new(dir, room_id)));
        let receiver = tokio::spawn(receive_loop(
            FrameContext {
                shared: shared.clone(),
                registry,
                history,
                max_depth: config.max_nesting_depth,
            },
            stream,
            receiver_token.clone(),
        ));

        shared.set_state(SessionState::Live);
        info!(room_id, "Live room session started");

        let (report_tx, report_rx) = watch::channel(None);
        tokio::spawn(supervise(Supervised {
            shared: shared.clone(),
            heartbeat: (heartbeat, heartbeat_token),
            receiver: (receiver, receiver_token),
            writer,
            timeout: config.shutdown_timeout(),
            report: report_tx,
        }));

        Ok(Self {
            shared,
            state_rx,
            report_rx,
        })
    }

    pub fn room_id(&self) -> u64 {
        self.shared.room_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Latest popularity value from a heartbeat reply; 0 before the first one.
    pub fn popularity(&self) -> u32 {
        self.shared.popularity.load(Ordering::Relaxed)
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the session is closed, by `stop()` or by a fatal error.
    pub async fn closed(&self) -> ShutdownReport {
        let mut rx = self.report_rx.clone();
        let report = match rx.wait_for(Option::is_some).await {
            Ok(report) => report.clone(),
            Err(_) => None,
        };
        report.unwrap_or_else(|| ShutdownReport {
            heartbeat_timed_out: false,
            receiver_timed_out: false,
            reason: CloseReason::Failed("session supervisor ended unexpectedly".to_string()),
        })
    }

    /// Stop the session: heartbeat first, then the receive loop, then the
    /// transport. Each step waits at most the configured shutdown timeout.
    /// Calling it again returns the same report.
    pub async fn stop(&self) -> ShutdownReport {
        self.shared.close_with(CloseReason::Requested);
        self.closed().await
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.shared.close_with(CloseReason::Requested);
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("room_id", &self.shared.room_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn open_endpoint(
    connector: &dyn Connector,
    endpoints: &[String],
    config: &ClientConfig,
) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
    let candidates = if config.endpoint_failover {
        endpoints
    } else {
        &endpoints[..endpoints.len().min(1)]
    };

    let mut last_error = None;
    for url in candidates {
        let attempt = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connector.connect(url))
                .await
                .unwrap_or_else(|_| {
                    Err(BliveError::transport(format!(
                        "Timed out after {}s connecting to {url}",
                        limit.as_secs()
                    )))
                }),
            None => connector.connect(url).await,
        };
        match attempt {
            Ok(halves) => {
                info!("Connected to {}", url);
                return Ok(halves);
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", url, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| BliveError::discovery("No danmu endpoint available")))
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    writer: Arc<Mutex<FrameWriter>>,
    token: CancellationToken,
    interval: Duration,
) {
    let room_id = shared.room_id;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A write in flight is allowed to finish; the supervisor bounds how
        // long it waits for that.
        let result = writer
            .lock()
            .await
            .send(Operation::Heartbeat, &codec::HEARTBEAT_PAYLOAD)
            .await;

        match result {
            Ok(()) => trace!(room_id, "Sent heartbeat"),
            Err(e) if token.is_cancelled() || shared.closing.is_cancelled() => {
                debug!(room_id, "Heartbeat failed during shutdown: {}", e);
                break;
            }
            Err(e) => {
                error!(room_id, "Failed to send heartbeat: {}", e);
                shared.fail(e.to_string());
                break;
            }
        }
    }
    debug!(room_id, "Heartbeat task stopped");
}

/// Per-frame processing state owned by the receive task.
struct FrameContext {
    shared: Arc<Shared>,
    registry: Arc<MessageRegistry>,
    history: Option<Arc<HistoryWriter>>,
    max_depth: usize,
}

impl FrameContext {
    /// Decode one physical frame and dispatch its packets in wire order.
    ///
    /// Returns an error only for failures that must close the session.
    async fn process(&self, frame: Bytes) -> Result<()> {
        let room_id = self.shared.room_id;
        let packets = match codec::decode(frame, self.max_depth).await {
            Ok(packets) => packets,
            Err(BliveError::Frame {
                offset,
                reason,
                raw,
            }) => {
                warn!(room_id, offset, "Dropping malformed frame: {}", reason);
                debug!(room_id, raw = ?raw, "Malformed frame contents");
                return Ok(());
            }
            Err(e) if e.is_fatal_to_session() => return Err(e),
            Err(e) => {
                warn!(room_id, "Failed to decode frame: {}", e);
                return Ok(());
            }
        };

        for packet in packets {
            match packet {
                Packet::Notification(body) => self.notification(&body).await,
                Packet::Popularity(value) => {
                    self.shared.popularity.store(value, Ordering::Relaxed);
                    debug!(room_id, popularity = value, "Heartbeat reply");
                }
                Packet::Authenticated => info!(room_id, "Authenticated"),
                Packet::Other { operation, body } => {
                    debug!(room_id, operation, len = body.len(), "Ignoring packet")
                }
            }
        }
        Ok(())
    }

    async fn notification(&self, body: &[u8]) {
        let room_id = self.shared.room_id;
        let message: Value = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(room_id, "Notification is not valid JSON: {}", e);
                return;
            }
        };

        self.registry.dispatch(room_id, &message).await;

        if let Some(history) = &self.history
            && let Err(e) = history.append(&message).await
        {
            warn!(room_id, path = %history.path().display(), "Failed to write history: {}", e);
        }
    }
}

async fn receive_loop(ctx: FrameContext, mut stream: Box<dyn FrameStream>, token: CancellationToken) {
    let room_id = ctx.shared.room_id;

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = stream.next_frame() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = ctx.process(frame) => result,
                };
                if let Err(e) = result {
                    error!(room_id, "Closing session: {}", e);
                    ctx.shared.fail(e.to_string());
                    break;
                }
            }
            Some(Err(e)) => {
                error!(room_id, "Connection error: {}", e);
                ctx.shared.fail(e.to_string());
                break;
            }
            None => {
                if !ctx.shared.closing.is_cancelled() {
                    warn!(room_id, "Connection closed by server");
                    ctx.shared.fail("connection closed by server");
                }
                break;
            }
        }
    }
    debug!(room_id, "Receive task stopped");
}

struct Supervised {
    shared: Arc<Shared>,
    heartbeat: (JoinHandle<()>, CancellationToken),
    receiver: (JoinHandle<()>, CancellationToken),
    writer: Arc<Mutex<FrameWriter>>,
    timeout: Duration,
    report: watch::Sender<Option<ShutdownReport>>,
}

async fn supervise(s: Supervised) {
    let Supervised {
        shared,
        heartbeat,
        receiver,
        writer,
        timeout,
        report,
    } = s;
    let room_id = shared.room_id;

    shared.closing.cancelled().await;
    shared.set_state(SessionState::Closing);
    debug!(room_id, "Closing session");

    heartbeat.1.cancel();
    let heartbeat_timed_out = !join_bounded(room_id, "heartbeat", heartbeat.0, timeout).await;

    receiver.1.cancel();
    let receiver_timed_out = !join_bounded(room_id, "receive", receiver.0, timeout).await;

    let close = async { writer.lock().await.sink.close().await };
    match tokio::time::timeout(timeout, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(room_id, "Transport close failed: {}", e),
        Err(_) => warn!(room_id, "Transport did not close within {:?}", timeout),
    }

    shared.set_state(SessionState::Closed);
    let reason = shared
        .reason
        .lock()
        .clone()
        .unwrap_or(CloseReason::Requested);
    info!(room_id, ?reason, "Live room session closed");

    report.send_replace(Some(ShutdownReport {
        heartbeat_timed_out,
        receiver_timed_out,
        reason,
    }));
}

/// Wait for `handle` up to `timeout`; abandon (abort) it otherwise.
/// Returns whether the task finished in time.
async fn join_bounded(room_id: u64, task: &str, mut handle: JoinHandle<()>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(room_id, task, "Task ended abnormally: {}", e);
            true
        }
        Err(_) => {
            warn!(
                room_id,
                task, "Task did not stop within {:?}, abandoning it", timeout
            );
            handle.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};
    use crate::test_support::{
        MockConnector, MockDiscovery, auth_reply_frame, heartbeat_reply_frame, notification_frame,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    fn params(
        discovery: Arc<MockDiscovery>,
        connector: Arc<MockConnector>,
        registry: MessageRegistry,
        config: ClientConfig,
    ) -> SessionParams {
        SessionParams {
            room_id: 6655,
            discovery,
            connector,
            registry: Arc::new(registry),
            config,
        }
    }

    fn danmaku(msg: &str) -> Value {
        json!({
            "cmd": "DANMU_MSG",
            "info": [
                [0, 1, 25, 16777215, 1700000000000_i64, 1, 0, "", 0, 0, 0, "", 0, "{}", "{}", {}],
                msg,
                [12345, "alice", 0, 0, 0, 5000, 1, "FFFFFF"],
                [],
                [10, 0, 0, ""],
                ["", ""],
                {},
                0,
                0
            ]
        })
    }

    fn danmaku_channel(registry: &mut MessageRegistry) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.subscribe_fn(EventKind::Danmaku, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        });
        rx
    }

    #[tokio::test]
    async fn test_connect_sends_auth_then_heartbeat() {
        let discovery = Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()]));
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            discovery.clone(),
            connector.clone(),
            MessageRegistry::with_defaults(),
            ClientConfig::default(),
        ))
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Live);

        let mut peer = connector.next_peer().await;
        assert_eq!(peer.url, "wss://a/sub");

        let auth = peer.next_sent().await.unwrap();
        let packets = codec::split_packets(&auth).unwrap();
        assert_eq!(packets[0].header.operation(), Some(Operation::Auth));
        assert_eq!(packets[0].header.sequence, 1);
        assert_eq!(packets[0].body, discovery.auth_payload());

        let heartbeat = peer.next_sent().await.unwrap();
        let packets = codec::split_packets(&heartbeat).unwrap();
        assert_eq!(packets[0].header.operation(), Some(Operation::Heartbeat));
        assert_eq!(packets[0].header.sequence, 2);
        assert_eq!(&packets[0].body[..], &codec::HEARTBEAT_PAYLOAD);

        let report = session.stop().await;
        assert_eq!(report.reason, CloseReason::Requested);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_interval() {
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await
        .unwrap();

        let mut peer = connector.next_peer().await;
        peer.next_sent().await.unwrap(); // auth
        let start = tokio::time::Instant::now();
        peer.next_sent().await.unwrap(); // immediate heartbeat
        peer.next_sent().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(31), "{elapsed:?}");

        session.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_and_popularity() {
        let mut registry = MessageRegistry::with_defaults();
        let mut events = danmaku_channel(&mut registry);
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            registry,
            ClientConfig::default(),
        ))
        .await
        .unwrap();

        let peer = connector.next_peer().await;
        peer.push(auth_reply_frame(0));
        let mut frame = notification_frame(&danmaku("first")).to_vec();
        frame.extend_from_slice(&notification_frame(&danmaku("second")));
        peer.push(Bytes::from(frame));
        peer.push(heartbeat_reply_frame(1234));
        peer.push(notification_frame(&danmaku("sync")));

        for expected in ["first", "second", "sync"] {
            match events.recv().await.unwrap() {
                Event::Danmaku(msg) => {
                    assert_eq!(msg.msg, expected);
                    assert_eq!(msg.room_id, 6655);
                }
                other => panic!("Unexpected event: {other:?}"),
            }
        }
        assert_eq!(session.popularity(), 1234);
        assert_eq!(session.state(), SessionState::Live);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let mut registry = MessageRegistry::with_defaults();
        let mut events = danmaku_channel(&mut registry);
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            registry,
            ClientConfig::default(),
        ))
        .await
        .unwrap();

        let peer = connector.next_peer().await;
        peer.push(Bytes::from_static(&[0, 0, 0, 99, 0, 16]));
        peer.push(notification_frame(&danmaku("after")));

        assert!(matches!(events.recv().await, Some(Event::Danmaku(_))));
        assert_eq!(session.state(), SessionState::Live);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_closes_session() {
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await
        .unwrap();

        let peer = connector.next_peer().await;
        peer.push(auth_reply_frame(-101));

        let report = session.closed().await;
        match report.reason {
            CloseReason::Failed(reason) => assert!(reason.contains("-101"), "{reason}"),
            other => panic!("Unexpected reason: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_server_close_fails_session() {
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await
        .unwrap();

        connector.next_peer().await.hang_up();
        let report = session.closed().await;
        assert!(matches!(report.reason, CloseReason::Failed(_)));

        // stop after close is harmless
        assert_eq!(session.stop().await, report);
    }

    #[tokio::test]
    async fn test_heartbeat_write_failure_fails_session() {
        let connector = Arc::new(MockConnector::new().fail_sends_after(1));
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector,
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await
        .unwrap();

        let report = session.closed().await;
        assert!(matches!(report.reason, CloseReason::Failed(_)));
    }

    #[tokio::test]
    async fn test_discovery_error_is_returned() {
        let discovery = Arc::new(MockDiscovery::new(vec![]));
        let result = ConnectionSession::connect(params(
            discovery,
            Arc::new(MockConnector::new()),
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await;
        assert!(matches!(result, Err(BliveError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_endpoint_failover() {
        let endpoints = vec!["wss://down/sub".to_string(), "wss://up/sub".to_string()];

        let connector = Arc::new(MockConnector::new().refuse("wss://down/sub"));
        let result = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(endpoints.clone())),
            connector,
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await;
        assert!(matches!(result, Err(BliveError::Transport(_))));

        let connector = Arc::new(MockConnector::new().refuse("wss://down/sub"));
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(endpoints)),
            connector.clone(),
            MessageRegistry::new(),
            ClientConfig {
                endpoint_failover: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
        assert_eq!(connector.next_peer().await.url, "wss://up/sub");
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_times_out() {
        let endpoints = vec!["wss://stuck/sub".to_string(), "wss://up/sub".to_string()];

        let started = tokio::time::Instant::now();
        let result = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(endpoints.clone())),
            Arc::new(MockConnector::new().hang("wss://stuck/sub")),
            MessageRegistry::new(),
            ClientConfig {
                connect_timeout_secs: 3,
                ..Default::default()
            },
        ))
        .await;
        assert!(matches!(result, Err(BliveError::Transport(_))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

        // the timeout counts as a failed endpoint for failover
        let connector = Arc::new(MockConnector::new().hang("wss://stuck/sub"));
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(endpoints)),
            connector.clone(),
            MessageRegistry::new(),
            ClientConfig {
                endpoint_failover: true,
                connect_timeout_secs: 3,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.next_peer().await.url, "wss://up/sub");
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_when_heartbeat_is_wedged() {
        // auth goes through, every later write hangs for 10s
        let connector = Arc::new(MockConnector::new().stall_sends_after(1, Duration::from_secs(10)));
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            MessageRegistry::new(),
            ClientConfig::default(),
        ))
        .await
        .unwrap();
        let peer = connector.next_peer().await;

        // let the first heartbeat start its stalled write
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = tokio::time::Instant::now();
        let report = session.stop().await;
        let elapsed = start.elapsed();

        assert!(report.heartbeat_timed_out);
        assert!(!report.receiver_timed_out);
        assert_eq!(report.reason, CloseReason::Requested);
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_history_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = MessageRegistry::with_defaults();
        let mut events = danmaku_channel(&mut registry);
        let connector = Arc::new(MockConnector::new());
        let session = ConnectionSession::connect(params(
            Arc::new(MockDiscovery::new(vec!["wss://a/sub".into()])),
            connector.clone(),
            registry,
            ClientConfig {
                history_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

        let peer = connector.next_peer().await;
        peer.push(notification_frame(&danmaku("saved")));
        peer.push(notification_frame(&danmaku("next")));
        // frames are processed in order, so the first record is on disk once
        // the second event arrives
        events.recv().await.unwrap();
        events.recv().await.unwrap();
        session.stop().await;

        let content = tokio::fs::read(dir.path().join("6655.json")).await.unwrap();
        let records: Vec<Value> = serde_json::from_slice(&content).unwrap();
        assert!(!records.is_empty());
        assert_eq!(records[0]["info"][1], "saved");
        assert!(records[0]["add_time"].is_string());
    }
}
