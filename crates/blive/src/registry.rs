//! Command → decoder table and handler fan-out.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{self, DecodeFn, Event, EventKind};

/// Commands the server sends that carry nothing worth decoding.
pub const IGNORED_COMMANDS: &[&str] = &[
    "COMBO_SEND",
    "ENTRY_EFFECT",
    "HOT_RANK_CHANGED",
    "HOT_RANK_CHANGED_V2",
    "LIVE",
    "LIVE_INTERACTIVE_GAME",
    "NOTICE_MSG",
    "ONLINE_RANK_COUNT",
    "ONLINE_RANK_TOP3",
    "ONLINE_RANK_V2",
    "PK_BATTLE_END",
    "PK_BATTLE_FINAL_PROCESS",
    "PK_BATTLE_PROCESS",
    "PK_BATTLE_PROCESS_NEW",
    "PK_BATTLE_SETTLE",
    "PK_BATTLE_SETTLE_USER",
    "PK_BATTLE_SETTLE_V2",
    "PREPARING",
    "ROOM_REAL_TIME_MESSAGE_UPDATE",
    "STOP_LIVE_ROOM_LIST",
    "SUPER_CHAT_MESSAGE_JPN",
    "WIDGET_BANNER",
    "RANK_CHANGED_V2",
    "ONLINE_RANK_V3",
    "COMMON_NOTICE_DANMAKU",
    "PK_BATTLE_PUNISH_END",
];

/// Receives decoded events of the kinds it was subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: &Event) {
        (self.f)(event.clone()).await
    }
}

/// What [`MessageRegistry::dispatch`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and delivered to `handlers` subscribers.
    Handled { handlers: usize },
    /// Command is on the ignore list.
    Ignored,
    /// First sighting of an unknown command; payload was logged.
    UnknownFirstSeen,
    /// Repeated unknown command, delivered through the generic decoder.
    UnknownFallback { handlers: usize },
    /// A registered decoder rejected the payload.
    DecodeFailed,
    /// The message had no `cmd` string.
    MissingCommand,
}

/// Maps server commands to typed decoders and delivers the resulting events.
///
/// Built once at startup, shared behind an `Arc` by every session of a client.
/// Registration and subscription take `&mut self`, so they cannot race with
/// dispatch.
#[derive(Default)]
pub struct MessageRegistry {
    decoders: FxHashMap<String, DecodeFn>,
    ignored: FxHashSet<String>,
    seen_unknown: Mutex<FxHashSet<String>>,
    handlers: FxHashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl MessageRegistry {
    /// Empty registry: no decoders, nothing ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in decoder and the default ignore list.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("DANMU_MSG", event::decode_danmaku)
            .register("DANMU_MSG_MIRROR", event::decode_danmaku)
            .register("SEND_GIFT", event::decode_gift)
            .register("GUARD_BUY", event::decode_guard_buy)
            .register("SUPER_CHAT_MESSAGE", event::decode_super_chat)
            .register("SUPER_CHAT_MESSAGE_DELETE", event::decode_super_chat_delete)
            .register("LOG_IN_NOTICE", event::decode_login_notice)
            .register("WATCHED_CHANGE", event::decode_watched_change)
            .register("LIKE_INFO_V3_CLICK", event::decode_like_click)
            .register("LIKE_INFO_V3_UPDATE", event::decode_like_update)
            .register("USER_TOAST_MSG", event::decode_user_toast)
            .register("INTERACT_WORD", event::decode_interact_word);
        for cmd in IGNORED_COMMANDS {
            registry.ignore(*cmd);
        }
        registry
    }

    /// Associate `cmd` (without any `:` suffix) with a decoder.
    pub fn register(&mut self, cmd: impl Into<String>, decoder: DecodeFn) -> &mut Self {
        let cmd = cmd.into();
        self.ignored.remove(&cmd);
        self.decoders.insert(cmd, decoder);
        self
    }

    /// Drop `cmd` silently.
    pub fn ignore(&mut self, cmd: impl Into<String>) -> &mut Self {
        self.ignored.insert(cmd.into());
        self
    }

    /// Deliver events of `kind` to `handler`. The same handler may be
    /// subscribed to several kinds.
    pub fn subscribe(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    /// Subscribe one handler to every kind in `kinds`.
    pub fn subscribe_all(&mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> &mut Self {
        for kind in kinds {
            self.subscribe(*kind, handler.clone());
        }
        self
    }

    /// Subscribe an async closure taking the event by value.
    pub fn subscribe_fn<F, Fut>(&mut self, kind: EventKind, f: F) -> &mut Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(kind, Arc::new(FnHandler { f }))
    }

    pub fn has_decoder(&self, cmd: &str) -> bool {
        self.decoders.contains_key(event::base_command(cmd))
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Decode one notification payload and run its handlers to completion.
    ///
    /// Never fails: decode errors and unknown commands are logged and reported
    /// through the returned outcome.
    pub async fn dispatch(&self, room_id: u64, raw: &Value) -> DispatchOutcome {
        let Some(full_cmd) = raw.get("cmd").and_then(Value::as_str) else {
            warn!(room_id, payload = %raw, "Notification without cmd");
            return DispatchOutcome::MissingCommand;
        };
        let cmd = event::base_command(full_cmd);

        if let Some(decoder) = self.decoders.get(cmd) {
            return match decoder(raw) {
                Ok(event) => {
                    let handlers = self.deliver(event.with_room_id(room_id)).await;
                    DispatchOutcome::Handled { handlers }
                }
                Err(e) => {
                    warn!(room_id, cmd, error = %e, "Failed to decode message");
                    DispatchOutcome::DecodeFailed
                }
            };
        }

        if self.ignored.contains(cmd) {
            return DispatchOutcome::Ignored;
        }

        let first_seen = self.seen_unknown.lock().insert(cmd.to_string());
        if first_seen {
            warn!(room_id, cmd, payload = %raw, "Unknown command");
            return DispatchOutcome::UnknownFirstSeen;
        }

        debug!(room_id, cmd, "Unknown command, using generic decoder");
        match event::decode_general(raw) {
            Ok(event) => {
                let handlers = self.deliver(event.with_room_id(room_id)).await;
                DispatchOutcome::UnknownFallback { handlers }
            }
            Err(e) => {
                warn!(room_id, cmd, error = %e, "Failed to decode message");
                DispatchOutcome::DecodeFailed
            }
        }
    }

    async fn deliver(&self, event: Event) -> usize {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return 0;
        };
        join_all(handlers.iter().map(|h| h.handle(&event))).await;
        handlers.len()
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("decoders", &self.decoders.len())
            .field("ignored", &self.ignored.len())
            .field("subscribed_kinds", &self.handlers.len())
            .finish()
    }
}
