//! Blive: Bilibili live-room client library.
//!
//! Connects to a live room's danmu WebSocket, keeps the connection alive with
//! heartbeats, decodes the binary frame protocol and delivers typed events to
//! subscribed handlers.
//!
//! ## Core Types
//!
//! - [`RoomClient`] - Start/stop a room connection, watch the live status, send chat
//! - [`ConnectionSession`] - One authenticated connection with its heartbeat and receive tasks
//! - [`MessageRegistry`] - Maps server commands to decoders and delivers [`Event`]s
//!
//! ## Protocol
//!
//! - [`codec`] - 16 byte packet headers, zlib/brotli nested packets, outbound control packets
//! - [`event`] - Typed messages (danmaku, gifts, super chats, ...) and their decoders
//!
//! ## Collaborators
//!
//! - [`api::BilibiliApi`] - Endpoint discovery, room lookups and chat sending over HTTP
//! - [`transport::WsConnector`] - tokio-tungstenite transport
//! - [`history::HistoryWriter`] - Per-room JSON history files

pub mod api;
pub mod client;
pub mod codec;
pub mod config;
pub mod cookie;
pub mod error;
pub mod event;
pub mod history;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
pub mod transport;
pub mod wbi;

pub use api::{BilibiliApi, DanmuInfo, RoomDiscovery, SendStatus};
pub use client::{RoomClient, RoomClientBuilder, RoomTarget};
pub use config::ClientConfig;
pub use error::{BliveError, Result};
pub use event::{Event, EventKind};
pub use registry::{DispatchOutcome, EventHandler, MessageRegistry};
pub use session::{CloseReason, ConnectionSession, SessionState, ShutdownReport};
