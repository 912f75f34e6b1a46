//! WebSocket transport seam.
//!
//! The session only needs to push binary frames out and pull binary frames in,
//! so the socket is split into a [`FrameSink`] and a [`FrameStream`]. Tests plug in
//! an in-memory pair (see `test_support`).

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{Request, Uri};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use crate::api::{DEFAULT_USER_AGENT, LIVE_ORIGIN};
use crate::error::{BliveError, Result};

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Send a close frame. Errors are informational; the connection is gone
    /// either way.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next binary frame; `None` once the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<Bytes>>;
}

/// Opens connections to danmu endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite connector sending browser-like upgrade headers.
#[derive(Debug, Clone)]
pub struct WsConnector {
    user_agent: String,
}

impl WsConnector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    fn request(&self, url: &str) -> Result<Request<()>> {
        let uri: Uri = url
            .parse()
            .map_err(|e| BliveError::transport(format!("Invalid endpoint {url}: {e}")))?;
        let host = uri
            .host()
            .ok_or_else(|| BliveError::transport(format!("Endpoint without host: {url}")))?;
        let host_header = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("User-Agent", &self.user_agent)
            .header("Origin", LIVE_ORIGIN)
            .header("Referer", LIVE_ORIGIN)
            .body(())
            .map_err(|e| BliveError::transport(format!("Failed to build request: {e}")))
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENT)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let request = self.request(url)?;
        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| BliveError::transport(format!("Failed to connect to {url}: {e}")))?;
        debug!("Connected to {}", url);

        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsFrames { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|e| BliveError::transport(format!("Write failed: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| BliveError::transport(format!("Close failed: {e}")))
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(frame)) => {
                    debug!("Server closed the connection: {:?}", frame);
                    return None;
                }
                Ok(other) => trace!("Skipping non-binary message: {:?}", other),
                Err(e) => return Some(Err(BliveError::transport(format!("Read failed: {e}")))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers() {
        let connector = WsConnector::new("test-agent");
        let request = connector
            .request("wss://broadcastlv.chat.bilibili.com:443/sub")
            .unwrap();

        let headers = request.headers();
        assert_eq!(headers["Host"], "broadcastlv.chat.bilibili.com:443");
        assert_eq!(headers["User-Agent"], "test-agent");
        assert_eq!(headers["Origin"], LIVE_ORIGIN);
        assert!(headers.contains_key("Sec-WebSocket-Key"));
    }

    #[test]
    fn test_request_rejects_bad_url() {
        let connector = WsConnector::default();
        assert!(matches!(
            connector.request("not a url"),
            Err(BliveError::Transport(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_real_connection() {
        let connector = WsConnector::default();
        let result = connector
            .connect("wss://broadcastlv.chat.bilibili.com:443/sub")
            .await;
        assert!(result.is_ok());
    }
}
