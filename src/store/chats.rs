use crate::types::chat::{ChatId, Conversation};
use crate::types::events::{ChatSummary, IncomingMessage};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::{Mutex, MutexGuard};

/// Directory of known chats, most recent activity first.
///
/// Holds its own copy of preview fields; it never shares structures with the
/// message store. Entries are created from the bulk snapshot or synthesized
/// from the first live event referencing an unknown id, and never removed
/// during a session.
#[derive(Default)]
pub struct ChatDirectory {
    chats: Mutex<Vec<Conversation>>,
}

impl ChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the bulk snapshot, replacing everything known so far. Called
    /// once per connection-ready transition.
    pub fn replace_all(&self, snapshot: &[ChatSummary]) {
        let mut chats = self.lock();
        *chats = snapshot
            .iter()
            .map(|c| Conversation {
                id: ChatId::new(c.id.clone()),
                name: c.name.clone(),
                is_group: c.is_group,
                unread_count: c.unread_count,
                last_message_preview: c.last_message.clone(),
                last_message_at: c.last_message_at,
            })
            .collect();
        debug!(target: "ChatDirectory", "Installed snapshot of {} chats", chats.len());
    }

    /// Applies an inbound message: refreshes the preview, bumps the unread
    /// counter unless the chat is the focused one, and moves the chat to the
    /// front. Unknown ids are synthesized from the event's sender fields.
    pub fn record_incoming(&self, event: &IncomingMessage, focused: bool) {
        let chat_id = ChatId::new(event.number.clone());
        let mut chats = self.lock();
        let mut convo = Self::take_or_synthesize(&mut chats, &chat_id, || {
            debug!(target: "ChatDirectory", "New chat {chat_id} synthesized from live traffic");
            let name = if event.chat_name.is_empty() {
                event.from.clone()
            } else {
                event.chat_name.clone()
            };
            Conversation {
                id: chat_id.clone(),
                name,
                is_group: event.is_group,
                unread_count: 0,
                last_message_preview: String::new(),
                last_message_at: None,
            }
        });

        convo.last_message_preview = event.body.clone();
        if let Some(ts) = DateTime::from_timestamp(event.timestamp, 0) {
            convo.last_message_at = Some(ts);
        }
        if !focused {
            convo.unread_count += 1;
        }
        chats.insert(0, convo);
    }

    /// Applies a locally-originated message: preview and recency only, never
    /// the unread counter.
    pub fn record_outgoing(&self, chat_id: &ChatId, body: &str, timestamp: DateTime<Utc>) {
        let mut chats = self.lock();
        let mut convo = Self::take_or_synthesize(&mut chats, chat_id, || Conversation {
            id: chat_id.clone(),
            name: chat_id.handle().to_string(),
            is_group: chat_id.is_group(),
            unread_count: 0,
            last_message_preview: String::new(),
            last_message_at: None,
        });

        convo.last_message_preview = body.to_string();
        convo.last_message_at = Some(timestamp);
        chats.insert(0, convo);
    }

    pub fn clear_unread(&self, chat_id: &ChatId) {
        let mut chats = self.lock();
        if let Some(convo) = chats.iter_mut().find(|c| &c.id == chat_id) {
            convo.unread_count = 0;
        }
    }

    pub fn conversation(&self, chat_id: &ChatId) -> Option<Conversation> {
        self.lock().iter().find(|c| &c.id == chat_id).cloned()
    }

    /// Current ordering, most recent activity first.
    pub fn snapshot(&self) -> Vec<Conversation> {
        self.lock().clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.lock().iter().map(|c| c.unread_count).sum()
    }

    /// Removes the chat from the list (to re-insert at the front), or builds
    /// a fresh entry. Only the touched chat moves; everything else keeps its
    /// relative order.
    fn take_or_synthesize(
        chats: &mut Vec<Conversation>,
        chat_id: &ChatId,
        synthesize: impl FnOnce() -> Conversation,
    ) -> Conversation {
        match chats.iter().position(|c| &c.id == chat_id) {
            Some(idx) => chats.remove(idx),
            None => synthesize(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Conversation>> {
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, name: &str, unread: u32, last: &str) -> ChatSummary {
        ChatSummary {
            id: id.to_string(),
            name: name.to_string(),
            is_group: id.ends_with("@g.us"),
            unread_count: unread,
            last_message: last.to_string(),
            last_message_at: None,
        }
    }

    fn incoming(number: &str, body: &str, timestamp: i64) -> IncomingMessage {
        IncomingMessage {
            from: "Alice".to_string(),
            number: number.to_string(),
            body: body.to_string(),
            timestamp,
            is_group: false,
            chat_name: "Alice".to_string(),
            message_id: None,
        }
    }

    #[test]
    fn test_snapshot_then_live_message_updates_entry() {
        let dir = ChatDirectory::new();
        dir.replace_all(&[summary("A@c.us", "Alice", 0, "")]);

        dir.record_incoming(&incoming("A@c.us", "hi", 1000), false);

        let chats = dir.snapshot();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id.as_str(), "A@c.us");
        assert_eq!(chats[0].unread_count, 1);
        assert_eq!(chats[0].last_message_preview, "hi");
        assert_eq!(
            chats[0].last_message_at.map(|t| t.timestamp_millis()),
            Some(1_000_000)
        );
    }

    #[test]
    fn test_unknown_chat_is_synthesized_with_single_unread() {
        let dir = ChatDirectory::new();
        dir.record_incoming(&incoming("B@c.us", "hello", 5), false);

        let chats = dir.snapshot();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "Alice");
        assert_eq!(chats[0].unread_count, 1);
    }

    #[test]
    fn test_focused_chat_never_accumulates_unread() {
        let dir = ChatDirectory::new();
        for i in 0..3 {
            dir.record_incoming(&incoming("A@c.us", "msg", 100 + i), true);
        }
        assert_eq!(dir.snapshot()[0].unread_count, 0);

        dir.record_incoming(&incoming("A@c.us", "msg", 200), false);
        assert_eq!(dir.snapshot()[0].unread_count, 1);
    }

    #[test]
    fn test_clear_unread_resets_to_zero() {
        let dir = ChatDirectory::new();
        let id = ChatId::new("A@c.us");
        for i in 0..4 {
            dir.record_incoming(&incoming("A@c.us", "msg", 100 + i), false);
        }
        assert_eq!(dir.snapshot()[0].unread_count, 4);

        dir.clear_unread(&id);
        assert_eq!(dir.snapshot()[0].unread_count, 0);
    }

    #[test]
    fn test_activity_moves_chat_to_front_and_rest_keep_order() {
        let dir = ChatDirectory::new();
        dir.replace_all(&[
            summary("A@c.us", "Alice", 0, ""),
            summary("B@c.us", "Bob", 0, ""),
            summary("C@c.us", "Carol", 0, ""),
        ]);

        dir.record_incoming(&incoming("C@c.us", "hi", 10), false);

        let order: Vec<String> = dir
            .snapshot()
            .iter()
            .map(|c| c.id.handle().to_string())
            .collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_outgoing_updates_preview_without_unread() {
        let dir = ChatDirectory::new();
        dir.replace_all(&[
            summary("A@c.us", "Alice", 2, "old"),
            summary("B@c.us", "Bob", 0, ""),
        ]);

        let id = ChatId::new("B@c.us");
        dir.record_outgoing(&id, "on my way", DateTime::from_timestamp(42, 0).unwrap());

        let chats = dir.snapshot();
        assert_eq!(chats[0].id, id);
        assert_eq!(chats[0].last_message_preview, "on my way");
        assert_eq!(chats[0].unread_count, 0);
        // The untouched chat keeps its counter.
        assert_eq!(chats[1].unread_count, 2);
    }

    #[test]
    fn test_outgoing_to_unknown_chat_synthesizes_from_id() {
        let dir = ChatDirectory::new();
        let id = ChatId::new("777@c.us");
        dir.record_outgoing(&id, "ping", DateTime::from_timestamp(1, 0).unwrap());

        let chats = dir.snapshot();
        assert_eq!(chats[0].name, "777");
        assert!(!chats[0].is_group);
    }
}
