//! Typed live-room events.
//!
//! Each server command with a registered decoder becomes one [`Event`]. The wire
//! payloads are loosely typed (positional arrays for chat, nested objects for the
//! rest), so every decoder validates the shape it reads and reports a
//! [`BliveError::Decode`] instead of panicking on missing fields.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{BliveError, Result};

/// Signature shared by every command decoder.
pub type DecodeFn = fn(&Value) -> Result<Event>;

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Chat message (danmaku)
    Danmaku,
    Gift,
    /// Guard (captain/admiral/governor) purchase
    GuardBuy,
    /// Paid highlighted message
    SuperChat,
    SuperChatDelete,
    /// Login reminder shown to guests
    LoginNotice,
    /// Viewer count change
    WatchedChange,
    LikeClick,
    LikeUpdate,
    /// Celebration toast after a guard purchase
    UserToast,
    /// Room entry / follow / share
    InteractWord,
    /// Fallback carrying the raw payload
    General,
}

/// A decoded live-room event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Danmaku(DanmakuMessage),
    Gift(GiftMessage),
    GuardBuy(GuardBuyMessage),
    SuperChat(SuperChatMessage),
    SuperChatDelete(SuperChatDeleteMessage),
    LoginNotice(LoginNoticeMessage),
    WatchedChange(WatchedChangeMessage),
    LikeClick(LikeClickMessage),
    LikeUpdate(LikeUpdateMessage),
    UserToast(UserToastMessage),
    InteractWord(InteractWordMessage),
    General(GeneralMessage),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Danmaku(_) => EventKind::Danmaku,
            Self::Gift(_) => EventKind::Gift,
            Self::GuardBuy(_) => EventKind::GuardBuy,
            Self::SuperChat(_) => EventKind::SuperChat,
            Self::SuperChatDelete(_) => EventKind::SuperChatDelete,
            Self::LoginNotice(_) => EventKind::LoginNotice,
            Self::WatchedChange(_) => EventKind::WatchedChange,
            Self::LikeClick(_) => EventKind::LikeClick,
            Self::LikeUpdate(_) => EventKind::LikeUpdate,
            Self::UserToast(_) => EventKind::UserToast,
            Self::InteractWord(_) => EventKind::InteractWord,
            Self::General(_) => EventKind::General,
        }
    }

    /// Room the event was received in.
    pub fn room_id(&self) -> u64 {
        match self {
            Self::Danmaku(m) => m.room_id,
            Self::Gift(m) => m.room_id,
            Self::GuardBuy(m) => m.room_id,
            Self::SuperChat(m) => m.room_id,
            Self::SuperChatDelete(m) => m.room_id,
            Self::LoginNotice(m) => m.room_id,
            Self::WatchedChange(m) => m.room_id,
            Self::LikeClick(m) => m.room_id,
            Self::LikeUpdate(m) => m.room_id,
            Self::UserToast(m) => m.room_id,
            Self::InteractWord(m) => m.room_id,
            Self::General(m) => m.room_id,
        }
    }

    /// Attach the room id; the wire payload never carries it.
    pub fn with_room_id(mut self, room_id: u64) -> Self {
        let slot = match &mut self {
            Self::Danmaku(m) => &mut m.room_id,
            Self::Gift(m) => &mut m.room_id,
            Self::GuardBuy(m) => &mut m.room_id,
            Self::SuperChat(m) => &mut m.room_id,
            Self::SuperChatDelete(m) => &mut m.room_id,
            Self::LoginNotice(m) => &mut m.room_id,
            Self::WatchedChange(m) => &mut m.room_id,
            Self::LikeClick(m) => &mut m.room_id,
            Self::LikeUpdate(m) => &mut m.room_id,
            Self::UserToast(m) => &mut m.room_id,
            Self::InteractWord(m) => &mut m.room_id,
            Self::General(m) => &mut m.room_id,
        };
        *slot = room_id;
        self
    }
}

/// Fan medal attached to a chat message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Medal {
    pub level: u64,
    pub name: String,
    /// Name of the streamer the medal belongs to
    pub anchor_name: String,
    pub room_id: u64,
    pub color: u64,
    pub special: String,
}

/// Chat message (`DANMU_MSG`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct DanmakuMessage {
    pub room_id: u64,
    /// Display mode (scroll, top, bottom)
    pub mode: u64,
    pub font_size: u64,
    pub color: u64,
    /// Milliseconds
    pub timestamp: i64,
    pub rnd: i64,
    pub uid_crc32: String,
    /// Non-zero for gift storm messages
    pub msg_type: u64,
    pub bubble: u64,
    /// 0 text, 1 emoticon, 2 voice
    pub dm_type: u64,
    pub emoticon_options: Value,
    pub voice_config: Value,
    pub mode_info: Value,

    pub msg: String,

    pub uid: u64,
    pub uname: String,
    pub admin: u64,
    pub vip: u64,
    pub svip: u64,
    pub urank: u64,
    pub mobile_verify: u64,
    pub uname_color: String,

    pub medal: Option<Medal>,

    pub user_level: u64,
    pub ulevel_color: u64,
    /// `">50000"` once the rank is out of range
    pub ulevel_rank: String,

    pub old_title: String,
    pub title: String,

    /// Guard level: 0 none, 1 governor, 2 admiral, 3 captain
    pub privilege_type: u64,
}

impl DanmakuMessage {
    /// Emoticon parameters, whether the wire sent an object or a JSON string.
    pub fn emoticon_options(&self) -> serde_json::Map<String, Value> {
        object_or_json_string(&self.emoticon_options)
    }

    /// Voice parameters, whether the wire sent an object or a JSON string.
    pub fn voice_config(&self) -> serde_json::Map<String, Value> {
        object_or_json_string(&self.voice_config)
    }
}

fn object_or_json_string(value: &Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(s) => match serde_json::from_str(s) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
        _ => serde_json::Map::new(),
    }
}

/// Gift message (`SEND_GIFT`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GiftMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    #[serde(rename = "giftName")]
    pub gift_name: String,
    pub num: u64,
    pub uname: String,
    #[serde(default)]
    pub face: String,
    #[serde(default)]
    pub guard_level: u64,
    pub uid: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "giftId")]
    pub gift_id: u64,
    #[serde(rename = "giftType", default)]
    pub gift_type: u64,
    #[serde(default)]
    pub action: String,
    /// Unit price in coins
    pub price: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub rnd: String,
    /// `silver` or `gold`; 1000 gold = 1 CNY
    pub coin_type: String,
    pub total_coin: u64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub tid: String,
}

/// Guard purchase (`GUARD_BUY`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuardBuyMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    pub uid: u64,
    pub username: String,
    pub guard_level: u64,
    pub num: u64,
    /// Unit price in gold coins
    pub price: u64,
    pub gift_id: u64,
    pub gift_name: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// Paid highlighted message (`SUPER_CHAT_MESSAGE`).
#[derive(Debug, Clone, Serialize)]
pub struct SuperChatMessage {
    pub room_id: u64,
    /// CNY
    pub price: u64,
    pub message: String,
    pub message_trans: String,
    pub start_time: i64,
    pub end_time: i64,
    /// Remaining seconds
    pub time: u64,
    /// Id used by deletion notices
    pub id: u64,
    pub gift_id: u64,
    pub gift_name: String,
    pub uid: u64,
    pub uname: String,
    pub face: String,
    pub guard_level: u64,
    pub user_level: u64,
    pub background_bottom_color: String,
    pub background_color: String,
    pub background_icon: String,
    pub background_image: String,
    pub background_price_color: String,
}

#[derive(Deserialize)]
struct SuperChatWire {
    price: u64,
    message: String,
    #[serde(default)]
    message_trans: String,
    start_time: i64,
    end_time: i64,
    time: u64,
    #[serde(deserialize_with = "number_from_string_or_number")]
    id: u64,
    gift: SuperChatGiftWire,
    uid: u64,
    user_info: SuperChatUserWire,
    #[serde(default)]
    background_bottom_color: String,
    #[serde(default)]
    background_color: String,
    #[serde(default)]
    background_icon: String,
    #[serde(default)]
    background_image: String,
    #[serde(default)]
    background_price_color: String,
}

#[derive(Deserialize)]
struct SuperChatGiftWire {
    gift_id: u64,
    gift_name: String,
}

#[derive(Deserialize)]
struct SuperChatUserWire {
    uname: String,
    #[serde(default)]
    face: String,
    #[serde(default)]
    guard_level: u64,
    #[serde(default)]
    user_level: u64,
}

/// Deleted super chats (`SUPER_CHAT_MESSAGE_DELETE`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuperChatDeleteMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    pub ids: Vec<u64>,
}

/// Login reminder (`LOG_IN_NOTICE`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginNoticeMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    #[serde(rename = "notice_msg")]
    pub message: String,
}

/// Viewer count (`WATCHED_CHANGE`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchedChangeMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    pub num: u64,
    pub text_small: String,
    /// Formatted as "N people watched"
    pub text_large: String,
}

/// A user liked the room (`LIKE_INFO_V3_CLICK`).
#[derive(Debug, Clone, Serialize)]
pub struct LikeClickMessage {
    pub room_id: u64,
    pub uname: String,
    pub uid: u64,
    pub face: String,
    pub like_text: String,
}

#[derive(Deserialize)]
struct LikeClickWire {
    uname: String,
    uinfo: UinfoWire,
    like_text: String,
}

#[derive(Deserialize)]
struct UinfoWire {
    uid: u64,
    base: UinfoBaseWire,
}

#[derive(Deserialize)]
struct UinfoBaseWire {
    #[serde(default)]
    face: String,
}

/// Like counter (`LIKE_INFO_V3_UPDATE`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LikeUpdateMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    pub click_count: u64,
}

/// Guard purchase celebration (`USER_TOAST_MSG`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserToastMessage {
    #[serde(skip_deserializing)]
    pub room_id: u64,
    #[serde(default, deserialize_with = "bool_from_int_or_bool")]
    pub anchor_show: bool,
    #[serde(default)]
    pub color: String,
    pub gift_id: u64,
    /// 1 governor, 2 admiral, 3 captain
    pub guard_level: u64,
    pub num: u64,
    /// Gold coins (CNY * 1000)
    pub price: u64,
    pub role_name: String,
    pub toast_msg: String,
    pub uid: u64,
    pub unit: String,
    pub username: String,
}

/// What an [`InteractWordMessage`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    Entry,
    Follow,
    Share,
    Other(u64),
}

/// Room entry / follow / share (`INTERACT_WORD`).
#[derive(Debug, Clone, Serialize)]
pub struct InteractWordMessage {
    pub room_id: u64,
    pub uname: String,
    pub uid: u64,
    pub face: String,
    /// 1 entry, 2 follow, 3 share
    pub msg_type: u64,
}

impl InteractWordMessage {
    pub fn interaction(&self) -> Interaction {
        match self.msg_type {
            1 => Interaction::Entry,
            2 => Interaction::Follow,
            3 => Interaction::Share,
            other => Interaction::Other(other),
        }
    }
}

#[derive(Deserialize)]
struct InteractWordWire {
    uname: String,
    uid: u64,
    uinfo: InteractUinfoWire,
    msg_type: u64,
}

#[derive(Deserialize)]
struct InteractUinfoWire {
    base: UinfoBaseWire,
}

/// Fallback for commands without a dedicated decoder.
#[derive(Debug, Clone, Serialize)]
pub struct GeneralMessage {
    pub room_id: u64,
    pub cmd: String,
    /// The `data` object, or the whole message when it has none.
    pub raw: Value,
}

/// Command with any `:version:variant` suffix removed.
pub fn base_command(cmd: &str) -> &str {
    cmd.split(':').next().unwrap_or(cmd)
}

fn command_of(raw: &Value) -> &str {
    raw.get("cmd").and_then(Value::as_str).unwrap_or_default()
}

fn data_of<'a>(raw: &'a Value, cmd: &str) -> Result<&'a Value> {
    raw.get("data")
        .ok_or_else(|| BliveError::decode(cmd, "missing data object"))
}

fn from_data<'a, T: Deserialize<'a>>(raw: &'a Value, cmd: &str) -> Result<T> {
    T::deserialize(data_of(raw, cmd)?).map_err(|e| BliveError::decode(cmd, e.to_string()))
}

/// Decode `DANMU_MSG`.
///
/// `info` is an array of arrays; the fields this client depends on (content,
/// sender, level, guard) are required, decorative ones fall back to defaults.
pub fn decode_danmaku(raw: &Value) -> Result<Event> {
    const CMD: &str = "DANMU_MSG";
    let info = InfoArray::root(raw, CMD)?;

    let meta = info.array(0)?;
    let user = info.array(2)?;
    let level = info.array(4)?;

    let medal = match info.optional_array(3) {
        Some(medal) if !medal.is_empty() => Some(Medal {
            level: medal.opt_u64(0),
            name: medal.opt_string(1),
            anchor_name: medal.opt_string(2),
            room_id: medal.opt_u64(3),
            color: medal.opt_u64(4),
            special: medal.opt_string(5),
        }),
        _ => None,
    };
    let title = info.optional_array(5);

    Ok(Event::Danmaku(DanmakuMessage {
        room_id: 0,
        mode: meta.u64(1)?,
        font_size: meta.u64(2)?,
        color: meta.u64(3)?,
        timestamp: meta.i64(4)?,
        rnd: meta.i64(5)?,
        uid_crc32: meta.opt_string(7),
        msg_type: meta.opt_u64(9),
        bubble: meta.opt_u64(10),
        dm_type: meta.opt_u64(12),
        emoticon_options: meta.opt_value(13),
        voice_config: meta.opt_value(14),
        mode_info: meta.opt_value(15),
        msg: info.string(1)?,
        uid: user.u64(0)?,
        uname: user.string(1)?,
        admin: user.opt_u64(2),
        vip: user.opt_u64(3),
        svip: user.opt_u64(4),
        urank: user.opt_u64(5),
        mobile_verify: user.opt_u64(6),
        uname_color: user.opt_string(7),
        medal,
        user_level: level.u64(0)?,
        ulevel_color: level.opt_u64(2),
        ulevel_rank: level.opt_string(3),
        old_title: title.as_ref().map(|t| t.opt_string(0)).unwrap_or_default(),
        title: title.as_ref().map(|t| t.opt_string(1)).unwrap_or_default(),
        privilege_type: info.u64(7)?,
    }))
}

pub fn decode_gift(raw: &Value) -> Result<Event> {
    from_data(raw, "SEND_GIFT").map(Event::Gift)
}

pub fn decode_guard_buy(raw: &Value) -> Result<Event> {
    from_data(raw, "GUARD_BUY").map(Event::GuardBuy)
}

pub fn decode_super_chat(raw: &Value) -> Result<Event> {
    let wire: SuperChatWire = from_data(raw, "SUPER_CHAT_MESSAGE")?;
    Ok(Event::SuperChat(SuperChatMessage {
        room_id: 0,
        price: wire.price,
        message: wire.message,
        message_trans: wire.message_trans,
        start_time: wire.start_time,
        end_time: wire.end_time,
        time: wire.time,
        id: wire.id,
        gift_id: wire.gift.gift_id,
        gift_name: wire.gift.gift_name,
        uid: wire.uid,
        uname: wire.user_info.uname,
        face: wire.user_info.face,
        guard_level: wire.user_info.guard_level,
        user_level: wire.user_info.user_level,
        background_bottom_color: wire.background_bottom_color,
        background_color: wire.background_color,
        background_icon: wire.background_icon,
        background_image: wire.background_image,
        background_price_color: wire.background_price_color,
    }))
}

pub fn decode_super_chat_delete(raw: &Value) -> Result<Event> {
    from_data(raw, "SUPER_CHAT_MESSAGE_DELETE").map(Event::SuperChatDelete)
}

pub fn decode_login_notice(raw: &Value) -> Result<Event> {
    from_data(raw, "LOG_IN_NOTICE").map(Event::LoginNotice)
}

pub fn decode_watched_change(raw: &Value) -> Result<Event> {
    from_data(raw, "WATCHED_CHANGE").map(Event::WatchedChange)
}

pub fn decode_like_click(raw: &Value) -> Result<Event> {
    let wire: LikeClickWire = from_data(raw, "LIKE_INFO_V3_CLICK")?;
    Ok(Event::LikeClick(LikeClickMessage {
        room_id: 0,
        uname: wire.uname,
        uid: wire.uinfo.uid,
        face: wire.uinfo.base.face,
        like_text: wire.like_text,
    }))
}

pub fn decode_like_update(raw: &Value) -> Result<Event> {
    from_data(raw, "LIKE_INFO_V3_UPDATE").map(Event::LikeUpdate)
}

pub fn decode_user_toast(raw: &Value) -> Result<Event> {
    from_data(raw, "USER_TOAST_MSG").map(Event::UserToast)
}

pub fn decode_interact_word(raw: &Value) -> Result<Event> {
    let wire: InteractWordWire = from_data(raw, "INTERACT_WORD")?;
    Ok(Event::InteractWord(InteractWordMessage {
        room_id: 0,
        uname: wire.uname,
        uid: wire.uid,
        face: wire.uinfo.base.face,
        msg_type: wire.msg_type,
    }))
}

/// Best-effort decoder used for unknown commands.
pub fn decode_general(raw: &Value) -> Result<Event> {
    Ok(Event::General(GeneralMessage {
        room_id: 0,
        cmd: base_command(command_of(raw)).to_string(),
        raw: raw.get("data").cloned().unwrap_or_else(|| raw.clone()),
    }))
}

/// Positional view over one level of the nested `info` array.
struct InfoArray<'a> {
    cmd: &'static str,
    path: String,
    items: &'a [Value],
}

impl<'a> InfoArray<'a> {
    fn root(raw: &'a Value, cmd: &'static str) -> Result<Self> {
        let items = raw
            .get("info")
            .and_then(Value::as_array)
            .ok_or_else(|| BliveError::decode(cmd, "info is missing or not an array"))?;
        Ok(Self {
            cmd,
            path: "info".to_string(),
            items,
        })
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn error(&self, idx: usize, reason: &str) -> BliveError {
        BliveError::decode(self.cmd, format!("{}[{idx}] {reason}", self.path))
    }

    fn get(&self, idx: usize) -> Result<&'a Value> {
        self.items
            .get(idx)
            .ok_or_else(|| self.error(idx, "out of range"))
    }

    fn array(&self, idx: usize) -> Result<InfoArray<'a>> {
        let items = self
            .get(idx)?
            .as_array()
            .ok_or_else(|| self.error(idx, "is not an array"))?;
        Ok(InfoArray {
            cmd: self.cmd,
            path: format!("{}[{idx}]", self.path),
            items,
        })
    }

    fn optional_array(&self, idx: usize) -> Option<InfoArray<'a>> {
        self.array(idx).ok()
    }

    fn u64(&self, idx: usize) -> Result<u64> {
        let value = self.get(idx)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| self.error(idx, "is not an unsigned integer"))
    }

    fn i64(&self, idx: usize) -> Result<i64> {
        let value = self.get(idx)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .ok_or_else(|| self.error(idx, "is not an integer"))
    }

    fn string(&self, idx: usize) -> Result<String> {
        self.get(idx)?
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| self.error(idx, "is not a string"))
    }

    fn opt_u64(&self, idx: usize) -> u64 {
        self.u64(idx).unwrap_or_default()
    }

    fn opt_string(&self, idx: usize) -> String {
        match self.items.get(idx) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    fn opt_value(&self, idx: usize) -> Value {
        self.items.get(idx).cloned().unwrap_or(Value::Null)
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn number_from_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("{n} is not an unsigned integer"))),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected number, found {other}"
        ))),
    }
}

fn bool_from_int_or_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or_default() != 0,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn danmaku_info() -> Value {
        json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [
                [0, 1, 25, 16777215, 1700000000000_i64, 1700000000, 0, "9f1c2a3b", 0, 0, 0, "", 0, "{}", "{}", {"extra": "{}"}],
                "hello world",
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

    #[test]
    fn test_decode_danmaku_scenario() {
        let event = decode_danmaku(&danmaku_info()).unwrap();
        assert_eq!(event.kind(), EventKind::Danmaku);

        let Event::Danmaku(msg) = event else {
            panic!("expected danmaku");
        };
        assert_eq!(msg.uname, "alice");
        assert_eq!(msg.msg, "hello world");
        assert_eq!(msg.uid, 12345);
        assert_eq!(msg.user_level, 10);
        assert_eq!(msg.privilege_type, 0);
        assert_eq!(msg.font_size, 25);
        assert_eq!(msg.color, 16777215);
        assert_eq!(msg.urank, 5000);
        assert_eq!(msg.uname_color, "FFFFFF");
        assert_eq!(msg.uid_crc32, "9f1c2a3b");
        assert!(msg.medal.is_none());
    }

    #[test]
    fn test_decode_danmaku_with_medal() {
        let mut raw = danmaku_info();
        raw["info"][3] = json!([21, "fans", "streamer", 6655, 1725515, "", 0]);
        raw["info"][7] = json!(3);

        let Event::Danmaku(msg) = decode_danmaku(&raw).unwrap() else {
            panic!("expected danmaku");
        };
        let medal = msg.medal.expect("medal");
        assert_eq!(medal.level, 21);
        assert_eq!(medal.name, "fans");
        assert_eq!(medal.anchor_name, "streamer");
        assert_eq!(medal.room_id, 6655);
        assert_eq!(msg.privilege_type, 3);
    }

    #[test]
    fn test_decode_danmaku_truncated_info_is_decode_error() {
        let raw = json!({"cmd": "DANMU_MSG", "info": [[0, 1, 25, 16777215, 0, 0], "hi"]});
        match decode_danmaku(&raw) {
            Err(BliveError::Decode { cmd, reason }) => {
                assert_eq!(cmd, "DANMU_MSG");
                assert!(reason.contains("info[2]"), "{reason}");
            }
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_danmaku_type_mismatch_is_decode_error() {
        let mut raw = danmaku_info();
        raw["info"][2][0] = json!("not a number");
        assert!(matches!(
            decode_danmaku(&raw),
            Err(BliveError::Decode { .. })
        ));
    }

    #[test]
    fn test_emoticon_options_from_string() {
        let mut raw = danmaku_info();
        raw["info"][0][13] = json!(r#"{"emoticon_unique":"official_13","width":183}"#);

        let Event::Danmaku(msg) = decode_danmaku(&raw).unwrap() else {
            panic!("expected danmaku");
        };
        let options = msg.emoticon_options();
        assert_eq!(options.get("emoticon_unique").unwrap(), "official_13");
        assert!(msg.voice_config().is_empty());
    }

    #[test]
    fn test_decode_gift() {
        let raw = json!({
            "cmd": "SEND_GIFT",
            "data": {
                "giftName": "Rocket",
                "num": 5,
                "uname": "GiftUser",
                "face": "https://example.invalid/face.png",
                "guard_level": 0,
                "uid": 42,
                "timestamp": 1700000000,
                "giftId": 31036,
                "giftType": 0,
                "action": "投喂",
                "price": 100,
                "rnd": 1700000000123_i64,
                "coin_type": "gold",
                "total_coin": 500,
                "tid": "1700000000123456"
            }
        });

        let Event::Gift(gift) = decode_gift(&raw).unwrap() else {
            panic!("expected gift");
        };
        assert_eq!(gift.gift_name, "Rocket");
        assert_eq!(gift.num, 5);
        assert_eq!(gift.uid, 42);
        assert_eq!(gift.rnd, "1700000000123");
        assert_eq!(gift.total_coin, 500);
    }

    #[test]
    fn test_decode_gift_missing_field_is_decode_error() {
        let raw = json!({"cmd": "SEND_GIFT", "data": {"uname": "x"}});
        assert!(matches!(decode_gift(&raw), Err(BliveError::Decode { .. })));

        let raw = json!({"cmd": "SEND_GIFT"});
        assert!(matches!(decode_gift(&raw), Err(BliveError::Decode { .. })));
    }

    #[test]
    fn test_decode_super_chat() {
        let raw = json!({
            "cmd": "SUPER_CHAT_MESSAGE",
            "data": {
                "price": 30,
                "message": "Hello",
                "start_time": 1700000000,
                "end_time": 1700000060,
                "time": 60,
                "id": "8832",
                "gift": {"gift_id": 12000, "gift_name": "醒目留言"},
                "uid": 99,
                "user_info": {"uname": "SCUser", "face": "", "guard_level": 3, "user_level": 20},
                "background_color": "#EDF5FF"
            }
        });

        let Event::SuperChat(sc) = decode_super_chat(&raw).unwrap() else {
            panic!("expected super chat");
        };
        assert_eq!(sc.price, 30);
        assert_eq!(sc.id, 8832);
        assert_eq!(sc.uname, "SCUser");
        assert_eq!(sc.guard_level, 3);
        assert_eq!(sc.gift_name, "醒目留言");
        assert_eq!(sc.message_trans, "");
        assert_eq!(sc.background_color, "#EDF5FF");
    }

    #[test]
    fn test_decode_interact_word() {
        let raw = json!({
            "cmd": "INTERACT_WORD",
            "data": {
                "uname": "viewer",
                "uid": 7,
                "uinfo": {"uid": 7, "base": {"face": "face.png"}},
                "msg_type": 3
            }
        });

        let Event::InteractWord(msg) = decode_interact_word(&raw).unwrap() else {
            panic!("expected interact word");
        };
        assert_eq!(msg.face, "face.png");
        assert_eq!(msg.interaction(), Interaction::Share);
    }

    #[test]
    fn test_decode_like_click_and_update() {
        let click = json!({
            "cmd": "LIKE_INFO_V3_CLICK",
            "data": {"uname": "fan", "uinfo": {"uid": 5, "base": {"face": "f"}}, "like_text": "为主播点赞了"}
        });
        let Event::LikeClick(msg) = decode_like_click(&click).unwrap() else {
            panic!("expected like click");
        };
        assert_eq!(msg.uid, 5);
        assert_eq!(msg.like_text, "为主播点赞了");

        let update = json!({"cmd": "LIKE_INFO_V3_UPDATE", "data": {"click_count": 1024}});
        let Event::LikeUpdate(msg) = decode_like_update(&update).unwrap() else {
            panic!("expected like update");
        };
        assert_eq!(msg.click_count, 1024);
    }

    #[test]
    fn test_decode_user_toast_accepts_int_flag() {
        let raw = json!({
            "cmd": "USER_TOAST_MSG",
            "data": {
                "anchor_show": 1,
                "color": "#00D1F1",
                "gift_id": 10003,
                "guard_level": 3,
                "num": 1,
                "price": 198000,
                "role_name": "舰长",
                "toast_msg": "<%user%> 开通了舰长",
                "uid": 11,
                "unit": "月",
                "username": "captain"
            }
        });
        let Event::UserToast(toast) = decode_user_toast(&raw).unwrap() else {
            panic!("expected toast");
        };
        assert!(toast.anchor_show);
        assert_eq!(toast.role_name, "舰长");
    }

    #[test]
    fn test_decode_general_keeps_data() {
        let raw = json!({"cmd": "FOO_BAR:1", "data": {"x": 1}});
        let event = decode_general(&raw).unwrap().with_room_id(77);

        assert_eq!(event.room_id(), 77);
        let Event::General(msg) = event else {
            panic!("expected general");
        };
        assert_eq!(msg.cmd, "FOO_BAR");
        assert_eq!(msg.raw, json!({"x": 1}));
    }

    #[test]
    fn test_base_command() {
        assert_eq!(base_command("DANMU_MSG:4:0:2:2:2:0"), "DANMU_MSG");
        assert_eq!(base_command("SEND_GIFT"), "SEND_GIFT");
        assert_eq!(base_command(""), "");
    }
}
