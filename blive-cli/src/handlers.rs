//! Console output for live-room events.

use async_trait::async_trait;
use blive::event::Interaction;
use blive::{Event, EventHandler, EventKind, MessageRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by every room.
#[derive(Debug, Default)]
pub struct Counters {
    pub danmaku: AtomicU64,
    pub entries: AtomicU64,
    pub shares: AtomicU64,
    /// Last printed viewer count
    pub watched: AtomicU64,
}

/// Prints one line per event.
#[derive(Debug, Default)]
pub struct ConsoleHandler {
    counters: Counters,
}

impl ConsoleHandler {
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Text printed for `event`; `None` when nothing should be printed.
    pub fn render(&self, event: &Event) -> Option<String> {
        let line = match event {
            Event::Danmaku(m) => {
                self.counters.danmaku.fetch_add(1, Ordering::Relaxed);
                format!(
                    "{}: {} | level: {} | guard: {}",
                    m.uname, m.msg, m.user_level, m.privilege_type
                )
            }
            Event::Gift(m) => format!(
                "{} sent {}x{} (CNY {:.2})",
                m.uname,
                m.gift_name,
                m.num,
                m.total_coin as f64 / 1000.0
            ),
            Event::LikeUpdate(m) => format!("likes: {}", m.click_count),
            Event::WatchedChange(m) => {
                if self.counters.watched.swap(m.num, Ordering::Relaxed) == m.num {
                    return None;
                }
                format!("watched: {}", m.text_large)
            }
            Event::LikeClick(m) => format!("[{}] {}", m.uname, m.like_text),
            Event::LoginNotice(m) => format!("notice: {}", m.message),
            Event::SuperChat(m) => format!("super chat ¥{} | {}: {}", m.price, m.uname, m.message),
            Event::GuardBuy(m) => format!("{} bought {}", m.username, m.gift_name),
            Event::InteractWord(m) => {
                let action = match m.interaction() {
                    Interaction::Follow => "followed the room",
                    Interaction::Share => {
                        self.counters.shares.fetch_add(1, Ordering::Relaxed);
                        "shared the room"
                    }
                    Interaction::Entry | Interaction::Other(_) => {
                        self.counters.entries.fetch_add(1, Ordering::Relaxed);
                        "entered the room"
                    }
                };
                format!(
                    "[{}] {} || entries: {} | danmaku: {}",
                    m.uname,
                    action,
                    self.counters.entries.load(Ordering::Relaxed),
                    self.counters.danmaku.load(Ordering::Relaxed)
                )
            }
            _ => return None,
        };
        Some(format!("[{}] | {}", event.room_id(), line))
    }
}

#[async_trait]
impl EventHandler for ConsoleHandler {
    async fn handle(&self, event: &Event) {
        if let Some(line) = self.render(event) {
            println!("{line}");
        }
    }
}

const PRINTED_KINDS: &[EventKind] = &[
    EventKind::Danmaku,
    EventKind::Gift,
    EventKind::LikeUpdate,
    EventKind::WatchedChange,
    EventKind::LikeClick,
    EventKind::LoginNotice,
    EventKind::SuperChat,
    EventKind::GuardBuy,
    EventKind::InteractWord,
];

/// Default registry with `handler` subscribed to every printed kind.
pub fn console_registry(handler: Arc<ConsoleHandler>) -> MessageRegistry {
    let mut registry = MessageRegistry::with_defaults();
    registry.subscribe_all(PRINTED_KINDS, handler);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use blive::event::{InteractWordMessage, WatchedChangeMessage};

    fn interact(msg_type: u64) -> Event {
        Event::InteractWord(InteractWordMessage {
            room_id: 6655,
            uname: "bob".to_string(),
            uid: 2,
            face: String::new(),
            msg_type,
        })
    }

    fn watched(num: u64) -> Event {
        Event::WatchedChange(WatchedChangeMessage {
            room_id: 6655,
            num,
            text_small: num.to_string(),
            text_large: format!("{num} watched"),
        })
    }

    #[test]
    fn test_interaction_counters() {
        let handler = ConsoleHandler::default();
        let line = handler.render(&interact(1)).unwrap();
        assert_eq!(line, "[6655] | [bob] entered the room || entries: 1 | danmaku: 0");

        handler.render(&interact(3)).unwrap();
        handler.render(&interact(2)).unwrap();
        assert_eq!(handler.counters().entries.load(Ordering::Relaxed), 1);
        assert_eq!(handler.counters().shares.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_watched_printed_on_change_only() {
        let handler = ConsoleHandler::default();
        assert!(handler.render(&watched(10)).is_some());
        assert!(handler.render(&watched(10)).is_none());
        assert!(handler.render(&watched(11)).is_some());
    }

    #[test]
    fn test_console_registry_subscriptions() {
        let registry = console_registry(Arc::new(ConsoleHandler::default()));
        assert_eq!(registry.handler_count(EventKind::Danmaku), 1);
        assert_eq!(registry.handler_count(EventKind::General), 0);
    }
}
