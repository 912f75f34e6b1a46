//! Public entry point: one [`RoomClient`] per live room.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{self, BilibiliApi, RoomDiscovery, SendStatus};
use crate::config::ClientConfig;
use crate::error::{BliveError, Result};
use crate::registry::MessageRegistry;
use crate::session::{ConnectionSession, SessionParams, SessionState, ShutdownReport};
use crate::transport::{Connector, WsConnector};

/// How the client identifies its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomTarget {
    /// Numeric live room id.
    Room(u64),
    /// Broadcaster user id; the room is looked up on first start.
    User(u64),
}

/// HTTP-backed collaborators. Dropped on [`RoomClient::close`].
struct Resources {
    api: Arc<BilibiliApi>,
    discovery: Arc<dyn RoomDiscovery>,
    /// The reqwest client was created by this client rather than passed in.
    owns_http: bool,
}

/// Builder for [`RoomClient`].
#[derive(Default)]
pub struct RoomClientBuilder {
    target: Option<RoomTarget>,
    config: ClientConfig,
    http: Option<Client>,
    discovery: Option<Arc<dyn RoomDiscovery>>,
    connector: Option<Arc<dyn Connector>>,
    registry: Option<MessageRegistry>,
}

impl RoomClientBuilder {
    pub fn room(mut self, room_id: u64) -> Self {
        self.target = Some(RoomTarget::Room(room_id));
        self
    }

    /// Follow the live room of broadcaster `uid`.
    pub fn user(mut self, uid: u64) -> Self {
        self.target = Some(RoomTarget::User(uid));
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a caller-owned HTTP client. It is shared, never released by
    /// [`RoomClient::close`].
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Replace the Bilibili HTTP discovery.
    pub fn discovery(mut self, discovery: Arc<dyn RoomDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Replace the WebSocket connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Decoders and subscriptions. Defaults to
    /// [`MessageRegistry::with_defaults`] with no subscribers.
    pub fn registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<RoomClient> {
        let target = self
            .target
            .ok_or_else(|| BliveError::config("Either a room id or a user id is required"))?;
        if matches!(target, RoomTarget::Room(0) | RoomTarget::User(0)) {
            return Err(BliveError::config("Room and user ids must be non-zero"));
        }

        let (http, owns_http) = match self.http {
            Some(client) => (client, false),
            None => (api::default_client(self.config.http_timeout())?, true),
        };
        let api = Arc::new(
            BilibiliApi::new(http, self.config.cookies.clone())
                .with_user_agent(self.config.user_agent.clone()),
        );
        let discovery = self
            .discovery
            .unwrap_or_else(|| api.clone() as Arc<dyn RoomDiscovery>);
        let connector = self
            .connector
            .unwrap_or_else(|| {
                Arc::new(WsConnector::new(self.config.user_agent.clone())) as Arc<dyn Connector>
            });

        let room_id = match target {
            RoomTarget::Room(id) => id,
            RoomTarget::User(_) => 0,
        };

        Ok(RoomClient {
            target,
            room_id: AtomicU64::new(room_id),
            config: self.config,
            registry: Arc::new(self.registry.unwrap_or_else(MessageRegistry::with_defaults)),
            connector,
            resources: parking_lot::RwLock::new(Some(Resources {
                api,
                discovery,
                owns_http,
            })),
            session: tokio::sync::Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
            connecting: parking_lot::Mutex::new(None),
            closed: CancellationToken::new(),
            monitor: parking_lot::Mutex::new(None),
        })
    }
}

/// Owns a room's identity and at most one live [`ConnectionSession`].
///
/// `stop()` leaves the client reusable; `close()` also releases the HTTP
/// resources it created and makes further `start()` calls fail.
pub struct RoomClient {
    target: RoomTarget,
    /// 0 until resolved from the user id.
    room_id: AtomicU64,
    config: ClientConfig,
    registry: Arc<MessageRegistry>,
    connector: Arc<dyn Connector>,
    resources: parking_lot::RwLock<Option<Resources>>,
    /// Only held briefly; never across discovery or the handshake.
    session: tokio::sync::Mutex<Option<ConnectionSession>>,
    /// Serializes `start()` calls.
    starting: tokio::sync::Mutex<()>,
    /// Cancelled by `stop()` to interrupt the in-flight `start()`.
    connecting: parking_lot::Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
    monitor: parking_lot::Mutex<Option<CancellationToken>>,
}

impl RoomClient {
    pub fn builder() -> RoomClientBuilder {
        RoomClientBuilder::default()
    }

    pub fn target(&self) -> RoomTarget {
        self.target
    }

    /// Resolved room id; `None` while a user target has not been resolved.
    pub fn room_id(&self) -> Option<u64> {
        match self.room_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a session exists and has not closed.
    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.state() != SessionState::Closed)
    }

    /// Latest popularity of the running session.
    pub async fn popularity(&self) -> Option<u32> {
        self.session.lock().await.as_ref().map(|s| s.popularity())
    }

    /// Whether `close()` will release the HTTP client (it was not passed in).
    pub fn owns_http_client(&self) -> bool {
        self.resources.read().as_ref().is_some_and(|r| r.owns_http)
    }

    fn discovery(&self) -> Result<Arc<dyn RoomDiscovery>> {
        self.resources
            .read()
            .as_ref()
            .map(|r| r.discovery.clone())
            .ok_or_else(|| BliveError::config("Client is closed"))
    }

    fn api(&self) -> Result<Arc<BilibiliApi>> {
        self.resources
            .read()
            .as_ref()
            .map(|r| r.api.clone())
            .ok_or_else(|| BliveError::config("Client is closed"))
    }

    async fn resolve_room_id(&self, discovery: &dyn RoomDiscovery) -> Result<u64> {
        if let Some(room_id) = self.room_id() {
            return Ok(room_id);
        }
        let RoomTarget::User(uid) = self.target else {
            return Err(BliveError::config("Room id missing"));
        };
        let room_id = discovery.resolve_room_from_user(uid).await?;
        info!(uid, room_id, "Resolved live room from user id");
        self.room_id.store(room_id, Ordering::Release);
        Ok(room_id)
    }

    /// Connect a new session unless one is already running.
    ///
    /// A session that closed on its own (auth rejected, server hung up) is
    /// replaced by a fresh one. A concurrent `stop()` or `close()` interrupts
    /// the connect and makes this return [`BliveError::Cancelled`].
    pub async fn start(&self) -> Result<()> {
        let _starting = self.starting.lock().await;
        if self.closed.is_cancelled() {
            return Err(BliveError::config("Client is closed"));
        }
        let discovery = self.discovery()?;
        api::install_rustls_provider();

        let previous = {
            let mut slot = self.session.lock().await;
            if let Some(session) = slot.as_ref()
                && session.state() != SessionState::Closed
            {
                debug!(room_id = session.room_id(), "Session already running");
                return Ok(());
            }
            slot.take()
        };
        if let Some(previous) = previous {
            let report = previous.closed().await;
            debug!(room_id = previous.room_id(), ?report, "Replacing closed session");
        }

        let token = CancellationToken::new();
        *self.connecting.lock() = Some(token.clone());
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => Err(BliveError::Cancelled),
            _ = self.closed.cancelled() => Err(BliveError::Cancelled),
            result = self.connect_session(discovery) => result,
        };

        let mut slot = self.session.lock().await;
        self.connecting.lock().take();
        let session = connected?;
        if token.is_cancelled() || self.closed.is_cancelled() {
            drop(slot);
            debug!(room_id = session.room_id(), "Start cancelled after connecting");
            session.stop().await;
            return Err(BliveError::Cancelled);
        }
        *slot = Some(session);
        Ok(())
    }

    async fn connect_session(&self, discovery: Arc<dyn RoomDiscovery>) -> Result<ConnectionSession> {
        let room_id = self.resolve_room_id(discovery.as_ref()).await?;
        ConnectionSession::connect(SessionParams {
            room_id,
            discovery,
            connector: self.connector.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        })
        .await
    }

    /// Tear down the current session, if any, and interrupt a `start()` in
    /// progress. The client can be started again.
    pub async fn stop(&self) -> Option<ShutdownReport> {
        if let Some(token) = self.connecting.lock().take() {
            debug!(target = ?self.target, "Interrupting pending start");
            token.cancel();
        }
        let session = self.session.lock().await.take()?;
        let report = session.stop().await;
        if report.heartbeat_timed_out || report.receiver_timed_out {
            warn!(room_id = session.room_id(), ?report, "Session stopped with abandoned tasks");
        }
        Some(report)
    }

    /// Wait until the current session closes, by `stop()` or on its own.
    /// Returns immediately when nothing is running.
    pub async fn wait_closed(&self) -> Option<ShutdownReport> {
        let mut state = self.session.lock().await.as_ref()?.watch_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(s) if s.state() == SessionState::Closed => Some(s.closed().await),
            _ => None,
        }
    }

    /// Stop the session and monitor, then release owned HTTP resources.
    /// A shared HTTP client is left to its owner.
    pub async fn close(&self) {
        self.closed.cancel();
        if let Some(token) = self.monitor.lock().take() {
            token.cancel();
        }
        self.stop().await;

        if let Some(resources) = self.resources.write().take() {
            if resources.owns_http {
                debug!(target = ?self.target, "Released owned HTTP client");
            }
            drop(resources);
        }
    }

    /// Poll the room status every `status_poll_interval` and log live
    /// start/end transitions. With `auto_connect` the session is started when
    /// the broadcast begins and stopped when it ends.
    ///
    /// A polling error ends the monitor. So does dropping the last `Arc` of the
    /// client, or calling `close()`. Spawning a new monitor cancels the
    /// previous one.
    pub fn spawn_live_monitor(self: &Arc<Self>, auto_connect: bool) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.monitor.lock().replace(token.clone()) {
            previous.cancel();
        }

        let client = Arc::downgrade(self);
        let poll_interval = self.config.status_poll_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut live = false;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(client) = client.upgrade() else {
                    break;
                };
                if let Err(e) = client.poll_status(&mut live, auto_connect).await {
                    error!(target = ?client.target, "Room status monitor stopped: {}", e);
                    break;
                }
            }
            debug!("Room status monitor finished");
        })
    }

    async fn poll_status(&self, live: &mut bool, auto_connect: bool) -> Result<()> {
        let discovery = self.discovery()?;
        let room_id = self.resolve_room_id(discovery.as_ref()).await?;
        let now_live = discovery.room_status(room_id).await?;

        if now_live == *live {
            return Ok(());
        }
        *live = now_live;

        if now_live {
            info!(room_id, "Live started");
            if auto_connect {
                match self.start().await {
                    Ok(()) => {}
                    Err(BliveError::Cancelled) => debug!(room_id, "Session start cancelled"),
                    Err(e) => error!(room_id, "Failed to start session: {}", e),
                }
            }
        } else {
            info!(room_id, "Live ended");
            if auto_connect {
                self.stop().await;
            }
        }
        Ok(())
    }

    /// Send a chat message to the room, optionally @-mentioning
    /// `reply = (uid, uname)`.
    pub async fn send_message(&self, message: &str, reply: Option<(u64, &str)>) -> Result<SendStatus> {
        let api = self.api()?;
        let room_id = self.resolve_room_id(self.discovery()?.as_ref()).await?;
        api.send_message(room_id, message, reply).await
    }
}

impl std::fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("target", &self.target)
            .field("room_id", &self.room_id())
            .finish_non_exhaustive()
    }
}
