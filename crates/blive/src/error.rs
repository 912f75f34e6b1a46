//! Error types for the live-room client.

use bytes::Bytes;
use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, BliveError>;

/// Errors that can occur while resolving, connecting to or reading a live room.
#[derive(Error, Debug)]
pub enum BliveError {
    /// The room or its danmu endpoints could not be resolved
    /// (nonexistent room, risk-control block, ...).
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Malformed header or buffer underrun while splitting a physical frame.
    #[error("Frame error at offset {offset}: {reason} ({} bytes)", raw.len())]
    Frame {
        offset: usize,
        reason: String,
        /// The physical frame that failed, kept for diagnostics.
        raw: Bytes,
    },

    /// The server rejected the auth packet.
    #[error("Auth error: code={code}, body={body}")]
    Auth { code: i64, body: String },

    /// The WebSocket closed unexpectedly or a write failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A known command carried a payload of unexpected shape.
    #[error("Decode error for {cmd}: {reason}")]
    Decode { cmd: String, reason: String },

    /// HTTP errors from the discovery / send APIs
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid configuration (cookies, room id, ...)
    #[error("Config error: {0}")]
    Config(String),

    /// `start()` was interrupted by `stop()` or `close()`.
    #[error("Start cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BliveError {
    /// Create a discovery error.
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a frame error for the frame `raw` at `offset`.
    pub fn frame(offset: usize, reason: impl Into<String>, raw: Bytes) -> Self {
        Self::Frame {
            offset,
            reason: reason.into(),
            raw,
        }
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a decode error for `cmd`.
    pub fn decode(cmd: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            cmd: cmd.into(),
            reason: reason.into(),
        }
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error compromises the connection and must close the session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Transport(_))
    }
}
