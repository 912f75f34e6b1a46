//! Bilibili HTTP collaborators: endpoint discovery, room lookup, room status
//! and outbound chat.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{COOKIE, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cookie;
use crate::error::{BliveError, Result};
use crate::wbi::WbiSigner;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0";
pub const LIVE_ORIGIN: &str = "https://live.bilibili.com";

pub const LIVE_API_BASE: &str = "https://api.live.bilibili.com";
pub const MAIN_API_BASE: &str = "https://api.bilibili.com";

/// Install the aws-lc-rs rustls provider once per process. Both reqwest and
/// the WebSocket TLS stack are built without a provider of their own.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// HTTP client used when the caller doesn't share one.
pub fn default_client(timeout: Duration) -> Result<Client> {
    install_rustls_provider();
    let mut builder = Client::builder().pool_max_idle_per_host(5);
    if timeout > Duration::ZERO {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// What a connection attempt needs: where to connect and what to authenticate with.
#[derive(Debug, Clone)]
pub struct DanmuInfo {
    /// `wss://` endpoints in server order, de-duplicated.
    pub endpoints: Vec<String>,
    /// Encoded [`AuthPayload`], sent verbatim as the auth packet body.
    pub auth_payload: Bytes,
}

/// Body of the auth packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthPayload {
    pub uid: u64,
    pub roomid: u64,
    pub protover: u32,
    pub platform: String,
    #[serde(rename = "type")]
    pub kind: u32,
    pub key: String,
}

impl AuthPayload {
    pub fn new(uid: u64, room_id: u64, key: impl Into<String>) -> Self {
        Self {
            uid,
            roomid: room_id,
            protover: 3,
            platform: "web".to_string(),
            kind: 2,
            key: key.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Endpoint / token discovery and room lookups.
#[async_trait]
pub trait RoomDiscovery: Send + Sync {
    /// Endpoints and auth payload for `room_id`.
    async fn resolve(&self, room_id: u64) -> Result<DanmuInfo>;

    /// Live room id owned by the broadcaster `uid`.
    async fn resolve_room_from_user(&self, uid: u64) -> Result<u64>;

    /// Whether `room_id` is broadcasting right now.
    async fn room_status(&self, room_id: u64) -> Result<bool>;
}

/// Result of [`BilibiliApi::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    NotLoggedIn,
    CsrfFailed,
    BadRequest,
    TooLong,
    RateLimited,
    Unknown { code: i64, message: String },
}

impl SendStatus {
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        match code {
            0 => Self::Success,
            -101 => Self::NotLoggedIn,
            -111 => Self::CsrfFailed,
            -400 => Self::BadRequest,
            1003212 => Self::TooLong,
            10031 => Self::RateLimited,
            code => Self::Unknown {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

impl ApiResponse {
    fn into_data(self, what: &str) -> Result<Value> {
        if self.code != 0 {
            return Err(BliveError::discovery(format!(
                "{what} failed: code={}, message={}",
                self.code, self.message
            )));
        }
        if self.data.is_null() {
            return Err(BliveError::discovery(format!("{what} returned no data")));
        }
        Ok(self.data)
    }
}

#[derive(Deserialize)]
struct DanmuInfoData {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    host_list: Vec<DanmuHost>,
}

#[derive(Deserialize)]
struct DanmuHost {
    host: String,
    wss_port: u16,
}

#[derive(Deserialize)]
struct AccInfoData {
    #[serde(default)]
    name: String,
    live_room: Option<LiveRoom>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveRoom {
    room_status: u8,
    #[serde(default)]
    live_status: u8,
    #[serde(default)]
    round_status: u8,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "roomid")]
    room_id: u64,
    #[serde(default)]
    watched_show: Option<WatchedShow>,
}

#[derive(Deserialize)]
struct WatchedShow {
    #[serde(default)]
    num: u64,
}

#[derive(Deserialize)]
struct RoomInfoData {
    live_status: u8,
}

fn parse_danmu_info(data: Value, room_id: u64, uid: u64) -> Result<DanmuInfo> {
    let data: DanmuInfoData = serde_json::from_value(data)
        .map_err(|e| BliveError::discovery(format!("Unexpected getDanmuInfo data: {e}")))?;
    let token = data
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BliveError::discovery(format!("No token for room {room_id}")))?;

    let mut endpoints: Vec<String> = Vec::with_capacity(data.host_list.len());
    for host in &data.host_list {
        let endpoint = format!("wss://{}:{}/sub", host.host, host.wss_port);
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    if endpoints.is_empty() {
        return Err(BliveError::discovery(format!(
            "Room {room_id} not found or blocked by risk control"
        )));
    }

    Ok(DanmuInfo {
        endpoints,
        auth_payload: AuthPayload::new(uid, room_id, token).encode()?,
    })
}

fn parse_live_room(data: Value, uid: u64) -> Result<u64> {
    let data: AccInfoData = serde_json::from_value(data)
        .map_err(|e| BliveError::discovery(format!("Unexpected acc/info data: {e}")))?;
    let room = data
        .live_room
        .filter(|r| r.room_status != 0)
        .ok_or_else(|| BliveError::discovery(format!("User {uid} has no live room")))?;

    info!(
        "[{}] live: {}, url: {}, room: {}, title: {}, rotating: {}, watched: {}",
        data.name,
        room.live_status != 0,
        room.url,
        room.room_id,
        room.title,
        room.round_status != 0,
        room.watched_show.map_or(0, |w| w.num)
    );
    if room.live_status == 0 {
        warn!("[{}] is not live, listening anyway", data.name);
    }
    Ok(room.room_id)
}

/// reqwest-backed implementation of the Bilibili web APIs.
#[derive(Debug)]
pub struct BilibiliApi {
    client: Client,
    cookies: Option<String>,
    user_agent: String,
    live_base: String,
    api_base: String,
    wbi: WbiSigner,
}

impl BilibiliApi {
    pub fn new(client: Client, cookies: Option<String>) -> Self {
        Self {
            client,
            cookies: cookies.filter(|c| !c.trim().is_empty()),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            live_base: LIVE_API_BASE.to_string(),
            api_base: MAIN_API_BASE.to_string(),
            wbi: WbiSigner::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Point the API at other hosts (`api.live.bilibili.com`, `api.bilibili.com`).
    pub fn with_base_urls(mut self, live_base: impl Into<String>, api_base: impl Into<String>) -> Self {
        self.live_base = live_base.into();
        self.api_base = api_base.into();
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Logged-in user id from the configured cookies; 0 for guests.
    pub fn login_uid(&self) -> u64 {
        self.cookies
            .as_deref()
            .and_then(cookie::login_uid)
            .unwrap_or_default()
    }

    fn decorate(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(USER_AGENT, &self.user_agent)
            .header(REFERER, LIVE_ORIGIN)
            .header(ORIGIN, LIVE_ORIGIN)
            .header(COOKIE, cookie::with_buvid3(self.cookies.as_deref()))
    }

    async fn get_json(&self, url: &str) -> Result<ApiResponse> {
        debug!("GET {}", url);
        Ok(self
            .decorate(self.client.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn signed_query(&self, params: Vec<(&str, String)>) -> Result<String> {
        let nav_url = format!("{}/x/web-interface/nav", self.api_base);
        self.wbi
            .sign(&self.client, |c| self.decorate(c.get(&nav_url)), params)
            .await
    }

    /// Post a chat message to `room_id`, optionally @-mentioning `reply`
    /// (`(uid, uname)`).
    pub async fn send_message(
        &self,
        room_id: u64,
        message: &str,
        reply: Option<(u64, &str)>,
    ) -> Result<SendStatus> {
        let csrf = self
            .cookies
            .as_deref()
            .and_then(cookie::csrf_token)
            .ok_or_else(|| BliveError::config("Sending messages requires a bili_jct cookie"))?;
        let (reply_mid, reply_uname) = reply.unwrap_or((0, ""));

        let form = [
            ("roomid", room_id.to_string()),
            ("csrf", csrf),
            ("msg", message.to_string()),
            ("rnd", chrono::Utc::now().timestamp().to_string()),
            ("fontsize", "25".to_string()),
            ("color", "16777215".to_string()),
            ("reply_mid", reply_mid.to_string()),
            ("reply_attr", "0".to_string()),
            ("reply_uname", reply_uname.to_string()),
            ("bubble", "0".to_string()),
        ];

        let response: ApiResponse = self
            .decorate(self.client.post(format!("{}/msg/send", self.live_base)))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status = SendStatus::from_code(response.code, response.message);
        match &status {
            SendStatus::Success => info!(room_id, "Sent message: {}", message),
            SendStatus::Unknown { code, message } => {
                warn!(room_id, code, "Send failed: {}", message)
            }
            other => warn!(room_id, "Send failed: {:?}", other),
        }
        Ok(status)
    }
}

#[async_trait]
impl RoomDiscovery for BilibiliApi {
    async fn resolve(&self, room_id: u64) -> Result<DanmuInfo> {
        let query = self
            .signed_query(vec![
                ("type", "0".to_string()),
                ("id", room_id.to_string()),
                ("web_location", "444.8".to_string()),
            ])
            .await?;
        let url = format!(
            "{}/xlive/web-room/v1/index/getDanmuInfo?{query}",
            self.live_base
        );
        let data = self.get_json(&url).await?.into_data("getDanmuInfo")?;
        let info = parse_danmu_info(data, room_id, self.login_uid())?;
        debug!(room_id, endpoints = info.endpoints.len(), "Resolved danmu info");
        Ok(info)
    }

    async fn resolve_room_from_user(&self, uid: u64) -> Result<u64> {
        let query = self
            .signed_query(vec![
                ("mid", uid.to_string()),
                ("web_location", "444.8".to_string()),
            ])
            .await?;
        let url = format!("{}/x/space/wbi/acc/info?{query}", self.api_base);
        let data = self.get_json(&url).await?.into_data("acc/info")?;
        parse_live_room(data, uid)
    }

    async fn room_status(&self, room_id: u64) -> Result<bool> {
        let url = format!(
            "{}/room/v1/Room/get_info?room_id={room_id}",
            self.live_base
        );
        let data = self.get_json(&url).await?.into_data("Room/get_info")?;
        let info: RoomInfoData = serde_json::from_value(data)?;
        Ok(info.live_status == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_nav(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/x/web-interface/nav"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": -101,
                "data": {"wbi_img": {
                    "img_url": "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png",
                    "sub_url": "https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png"
                }}
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    fn api(server: &MockServer, cookies: Option<&str>) -> BilibiliApi {
        BilibiliApi::new(
            default_client(Duration::from_secs(5)).unwrap(),
            cookies.map(str::to_string),
        )
            .with_base_urls(server.uri(), server.uri())
    }

    #[test]
    fn test_auth_payload_json() {
        let payload = AuthPayload::new(0, 6655, "tok").encode().unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            value,
            json!({"uid": 0, "roomid": 6655, "protover": 3, "platform": "web", "type": 2, "key": "tok"})
        );
    }

    #[test]
    fn test_send_status_codes() {
        assert_eq!(SendStatus::from_code(0, ""), SendStatus::Success);
        assert_eq!(SendStatus::from_code(-101, ""), SendStatus::NotLoggedIn);
        assert_eq!(SendStatus::from_code(-111, ""), SendStatus::CsrfFailed);
        assert_eq!(SendStatus::from_code(-400, ""), SendStatus::BadRequest);
        assert_eq!(SendStatus::from_code(1003212, ""), SendStatus::TooLong);
        assert_eq!(SendStatus::from_code(10031, ""), SendStatus::RateLimited);
        assert_eq!(
            SendStatus::from_code(42, "odd"),
            SendStatus::Unknown {
                code: 42,
                message: "odd".to_string()
            }
        );
    }

    #[test]
    fn test_parse_danmu_info_dedups_endpoints() {
        let data = json!({
            "token": "abc",
            "host_list": [
                {"host": "a.chat.bilibili.com", "port": 2243, "wss_port": 443, "ws_port": 2244},
                {"host": "b.chat.bilibili.com", "port": 2243, "wss_port": 443, "ws_port": 2244},
                {"host": "a.chat.bilibili.com", "port": 2243, "wss_port": 443, "ws_port": 2244}
            ]
        });
        let info = parse_danmu_info(data, 6655, 42).unwrap();
        assert_eq!(
            info.endpoints,
            vec![
                "wss://a.chat.bilibili.com:443/sub".to_string(),
                "wss://b.chat.bilibili.com:443/sub".to_string()
            ]
        );

        let auth: AuthPayload = serde_json::from_slice(&info.auth_payload).unwrap();
        assert_eq!(auth, AuthPayload::new(42, 6655, "abc"));
    }

    #[test]
    fn test_parse_danmu_info_rejects_missing_pieces() {
        assert!(matches!(
            parse_danmu_info(json!({"host_list": [{"host": "a", "wss_port": 443}]}), 1, 0),
            Err(BliveError::Discovery(_))
        ));
        assert!(matches!(
            parse_danmu_info(json!({"token": "t", "host_list": []}), 1, 0),
            Err(BliveError::Discovery(_))
        ));
    }

    #[test]
    fn test_parse_live_room() {
        let data = json!({
            "name": "streamer",
            "live_room": {
                "roomStatus": 1, "liveStatus": 0, "roundStatus": 0,
                "url": "https://live.bilibili.com/6655", "title": "t",
                "roomid": 6655, "watched_show": {"num": 10}
            }
        });
        assert_eq!(parse_live_room(data, 1).unwrap(), 6655);

        let data = json!({"name": "nobody", "live_room": {"roomStatus": 0, "roomid": 0}});
        assert!(matches!(parse_live_room(data, 1), Err(BliveError::Discovery(_))));

        let data = json!({"name": "nobody", "live_room": null});
        assert!(matches!(parse_live_room(data, 1), Err(BliveError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_resolve_signs_request() {
        let server = MockServer::start().await;
        mount_nav(&server).await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getDanmuInfo"))
            .and(query_param("id", "6655"))
            .and(query_param("web_location", "444.8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"token": "tok", "host_list": [{"host": "h", "wss_port": 443}]}
            })))
            .mount(&server)
            .await;

        let api = api(&server, Some("SESSDATA=s; DedeUserID=7; bili_jct=c"));
        let info = api.resolve(6655).await.unwrap();
        assert_eq!(info.endpoints, vec!["wss://h:443/sub".to_string()]);

        let auth: AuthPayload = serde_json::from_slice(&info.auth_payload).unwrap();
        assert_eq!(auth.uid, 7);

        // keys are cached, nav is hit once
        api.resolve(6655).await.unwrap();
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().any(|r| r.url.query().unwrap_or_default().contains("w_rid=")));
    }

    #[tokio::test]
    async fn test_resolve_nonzero_code_is_discovery_error() {
        let server = MockServer::start().await;
        mount_nav(&server).await;
        Mock::given(method("GET"))
            .and(path("/xlive/web-room/v1/index/getDanmuInfo"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": -352, "message": "-352"})),
            )
            .mount(&server)
            .await;

        let result = api(&server, None).resolve(1).await;
        assert!(matches!(result, Err(BliveError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_room_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/room/v1/Room/get_info"))
            .and(query_param("room_id", "6655"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 0, "data": {"live_status": 1}})),
            )
            .mount(&server)
            .await;

        assert!(api(&server, None).room_status(6655).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/msg/send"))
            .and(body_string_contains("csrf=token"))
            .and(body_string_contains("roomid=6655"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 10031, "message": "too fast"})),
            )
            .mount(&server)
            .await;

        let api = api(&server, Some("SESSDATA=s; bili_jct=token"));
        let status = api.send_message(6655, "hi", None).await.unwrap();
        assert_eq!(status, SendStatus::RateLimited);
    }

    #[tokio::test]
    async fn test_send_message_requires_csrf() {
        let server = MockServer::start().await;
        let result = api(&server, Some("SESSDATA=s")).send_message(1, "hi", None).await;
        assert!(matches!(result, Err(BliveError::Config(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
