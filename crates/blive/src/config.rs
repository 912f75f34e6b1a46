//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_USER_AGENT;
use crate::codec::DEFAULT_MAX_NESTING_DEPTH;

/// Settings shared by a [`RoomClient`](crate::RoomClient) and its sessions.
///
/// Every field has a default, so a partial TOML table deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds between heartbeat packets.
    pub heartbeat_interval_secs: u64,
    /// Upper bound for each task to stop during shutdown.
    pub shutdown_timeout_secs: u64,
    /// Maximum number of nested compressed packets accepted in one frame.
    pub max_nesting_depth: usize,
    /// Seconds between room status polls of the live monitor.
    pub status_poll_interval_secs: u64,
    /// Try the remaining endpoints when the first one refuses the connection.
    pub endpoint_failover: bool,
    /// Seconds allowed for each WebSocket handshake. 0 disables the limit.
    pub connect_timeout_secs: u64,
    /// Timeout for HTTP requests made by an owned client. 0 disables it.
    pub http_timeout_secs: u64,
    /// Raw `Cookie` header value (`SESSDATA=..; bili_jct=..; DedeUserID=..`).
    pub cookies: Option<String>,
    /// Directory for per-room JSON history files; `None` disables history.
    pub history_dir: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            shutdown_timeout_secs: 5,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            status_poll_interval_secs: 5,
            endpoint_failover: false,
            connect_timeout_secs: 10,
            http_timeout_secs: 30,
            cookies: None,
            history_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs.max(1))
    }

    /// `None` when the handshake is not bounded.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
