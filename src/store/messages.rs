use crate::error::FetchError;
use crate::history::HistoryFetcher;
use crate::types::chat::{ChatId, DeliveryStatus, Direction, Message};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-chat timeline state.
///
/// `generation` identifies one lifetime of the entry: it changes when a chat
/// is released and later re-created, which is how in-flight page responses
/// for a dead view are recognized and discarded.
#[derive(Debug)]
struct ChatTimeline {
    generation: u64,
    messages: Vec<Message>,
    seen_ids: HashSet<String>,
    has_more: bool,
    loading: bool,
    /// True once an initial page has been installed. Live pushes may create
    /// the entry earlier, but backward pagination needs a cursor from a
    /// fetched page first.
    initialized: bool,
}

impl ChatTimeline {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            has_more: false,
            loading: false,
            initialized: false,
        }
    }

    /// Insert keeping timestamps non-decreasing; equal timestamps keep
    /// insertion order.
    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .messages
            .iter()
            .rposition(|m| m.timestamp <= message.timestamp)
            .map_or(0, |i| i + 1);
        self.messages.insert(idx, message);
    }

    fn install_page(&mut self, mut messages: Vec<Message>, has_more: bool) {
        messages.sort_by_key(|m| m.timestamp);
        self.seen_ids = messages.iter().map(|m| m.id.clone()).collect();
        self.messages = messages;
        self.has_more = has_more;
        self.initialized = true;
    }

    /// Prepend an older page, dropping ids already present. Pages are
    /// disjoint under normal operation, but overlap must be tolerated.
    fn prepend_page(&mut self, messages: Vec<Message>, has_more: bool) -> usize {
        let fresh: Vec<Message> = messages
            .into_iter()
            .filter(|m| !self.seen_ids.contains(&m.id))
            .collect();
        for m in &fresh {
            self.seen_ids.insert(m.id.clone());
        }
        let added = fresh.len();
        self.messages.splice(0..0, fresh);
        self.has_more = has_more;
        added
    }
}

/// Keyed, in-memory message timelines: one ordered, deduplicated list per
/// chat, reconciling paginated history fetches with the live push stream.
///
/// All mutation is synchronous under one lock; the lock is never held across
/// a fetch, so transport events interleave freely with pagination and the
/// guards below carry the consistency burden.
pub struct MessageStore {
    fetcher: Arc<dyn HistoryFetcher>,
    page_size: u32,
    chats: Mutex<HashMap<ChatId, ChatTimeline>>,
    generations: AtomicU64,
}

impl MessageStore {
    pub fn new(fetcher: Arc<dyn HistoryFetcher>, page_size: u32) -> Self {
        Self {
            fetcher,
            page_size,
            chats: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Fetches the most recent page and replaces the chat's timeline with it.
    ///
    /// On failure the prior state (if any) is left untouched and the error is
    /// returned to the caller. A call while a load is already in flight for
    /// the chat is a no-op.
    pub async fn load_initial(&self, chat_id: &ChatId) -> Result<(), FetchError> {
        {
            let mut chats = self.lock();
            let entry = chats
                .entry(chat_id.clone())
                .or_insert_with(|| ChatTimeline::new(self.next_generation()));
            if entry.loading {
                debug!(target: "MessageStore", "Load already in flight for {chat_id}, skipping");
                return Ok(());
            }
            entry.loading = true;
        }

        let result = self.fetcher.fetch_page(chat_id, self.page_size, None).await;

        let mut chats = self.lock();
        let Some(entry) = chats.get_mut(chat_id) else {
            debug!(target: "MessageStore", "Chat {chat_id} released mid-load, dropping page");
            return Ok(());
        };
        entry.loading = false;
        let page = result?;
        debug!(
            target: "MessageStore",
            "Installed {} messages for {chat_id} (has_more={})",
            page.messages.len(),
            page.has_more
        );
        entry.install_page(page.messages, page.has_more);
        Ok(())
    }

    /// Fetches the page preceding the earliest loaded message and prepends it.
    ///
    /// A no-op when the chat has no initial page yet, when there is nothing
    /// older, or when a load is already in flight (concurrent calls for one
    /// chat are serialized by rejection). A response that arrives after the
    /// chat was released is discarded: the cursor it was computed from no
    /// longer describes any live view.
    pub async fn load_older(&self, chat_id: &ChatId) -> Result<(), FetchError> {
        let (generation, cursor) = {
            let mut chats = self.lock();
            let Some(entry) = chats.get_mut(chat_id) else {
                return Ok(());
            };
            if !entry.initialized || entry.loading || !entry.has_more {
                debug!(target: "MessageStore", "Nothing to page for {chat_id}");
                return Ok(());
            }
            let Some(earliest) = entry.messages.first() else {
                return Ok(());
            };
            entry.loading = true;
            (entry.generation, earliest.timestamp)
        };

        let result = self
            .fetcher
            .fetch_page(chat_id, self.page_size, Some(cursor))
            .await;

        let mut chats = self.lock();
        let entry = match chats.get_mut(chat_id) {
            Some(entry) if entry.generation == generation => entry,
            _ => {
                debug!(target: "MessageStore", "Discarding stale history page for {chat_id}");
                return Ok(());
            }
        };
        entry.loading = false;
        let page = result?;
        let added = entry.prepend_page(page.messages, page.has_more);
        debug!(
            target: "MessageStore",
            "Prepended {added} older messages for {chat_id} (has_more={})",
            entry.has_more
        );
        Ok(())
    }

    /// Merges one live-pushed or locally-confirmed message into the chat's
    /// timeline. Returns false when the id was already seen (retransmits are
    /// absorbed here, silently).
    pub fn append_live(&self, message: Message) -> bool {
        let mut chats = self.lock();
        let entry = chats
            .entry(message.chat_id.clone())
            .or_insert_with(|| ChatTimeline::new(self.next_generation()));
        if entry.seen_ids.contains(&message.id) {
            debug!(
                target: "MessageStore",
                "Duplicate message {} in {}, ignoring",
                message.id,
                message.chat_id
            );
            return false;
        }
        entry.seen_ids.insert(message.id.clone());
        entry.insert_sorted(message);
        true
    }

    /// Updates the delivery marker of an outgoing message in place.
    pub fn mark_delivery(
        &self,
        chat_id: &ChatId,
        message_id: &str,
        status: DeliveryStatus,
    ) -> bool {
        let mut chats = self.lock();
        let Some(entry) = chats.get_mut(chat_id) else {
            return false;
        };
        for message in entry.messages.iter_mut() {
            if message.id == message_id && message.direction == Direction::Outgoing {
                message.delivery = Some(status);
                return true;
            }
        }
        false
    }

    /// Drops a chat's timeline. Any in-flight page load for it becomes a
    /// stale response and will be discarded on arrival.
    pub fn release(&self, chat_id: &ChatId) -> bool {
        self.lock().remove(chat_id).is_some()
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.lock()
            .get(chat_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    pub fn has_more(&self, chat_id: &ChatId) -> bool {
        self.lock().get(chat_id).is_some_and(|e| e.has_more)
    }

    pub fn is_loading(&self, chat_id: &ChatId) -> bool {
        self.lock().get(chat_id).is_some_and(|e| e.loading)
    }

    pub fn is_loaded(&self, chat_id: &ChatId) -> bool {
        self.lock().get(chat_id).is_some_and(|e| e.initialized)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChatId, ChatTimeline>> {
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryPage;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn msg(id: &str, chat: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            chat_id: ChatId::new(chat),
            direction: Direction::Incoming,
            sender_label: Some("Alice".into()),
            body: format!("body-{id}"),
            timestamp: ts(secs),
            is_group: false,
            delivery: None,
        }
    }

    /// Scripted fetcher: pops pre-programmed responses in order and counts
    /// calls.
    struct ScriptedFetcher {
        pages: AsyncMutex<Vec<Result<HistoryPage, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<HistoryPage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                pages: AsyncMutex::new(pages),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HistoryFetcher for ScriptedFetcher {
        async fn fetch_page(
            &self,
            _chat_id: &ChatId,
            _limit: u32,
            _before: Option<DateTime<Utc>>,
        ) -> Result<HistoryPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().await;
            if pages.is_empty() {
                return Ok(HistoryPage {
                    messages: vec![],
                    has_more: false,
                });
            }
            pages.remove(0)
        }
    }

    #[tokio::test]
    async fn test_initial_then_older_page_merge() {
        let chat = ChatId::new("A@c.us");
        let fetcher = ScriptedFetcher::new(vec![
            Ok(HistoryPage {
                messages: vec![msg("m1", "A@c.us", 100), msg("m2", "A@c.us", 200)],
                has_more: true,
            }),
            Ok(HistoryPage {
                messages: vec![msg("m0", "A@c.us", 50)],
                has_more: false,
            }),
        ]);
        let store = MessageStore::new(fetcher.clone(), 50);

        store.load_initial(&chat).await.unwrap();
        assert!(store.has_more(&chat));

        store.load_older(&chat).await.unwrap();
        let timeline = store.messages(&chat);
        let ids: Vec<&str> = timeline.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
        assert!(!store.has_more(&chat));
    }

    #[tokio::test]
    async fn test_load_older_without_initial_page_is_noop() {
        let chat = ChatId::new("A@c.us");
        let fetcher = ScriptedFetcher::new(vec![]);
        let store = MessageStore::new(fetcher.clone(), 50);

        store.load_older(&chat).await.unwrap();
        assert_eq!(fetcher.call_count(), 0);

        // A live-only timeline has no cursor either.
        store.append_live(msg("live", "A@c.us", 10));
        store.load_older(&chat).await.unwrap();
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_load_older_exhausted_is_noop() {
        let chat = ChatId::new("A@c.us");
        let fetcher = ScriptedFetcher::new(vec![Ok(HistoryPage {
            messages: vec![msg("m1", "A@c.us", 100)],
            has_more: false,
        })]);
        let store = MessageStore::new(fetcher.clone(), 50);

        store.load_initial(&chat).await.unwrap();
        assert_eq!(fetcher.call_count(), 1);

        store.load_older(&chat).await.unwrap();
        // No request issued and no state change.
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(store.messages(&chat).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_preserves_prior_state() {
        let chat = ChatId::new("A@c.us");
        let fetcher = ScriptedFetcher::new(vec![
            Ok(HistoryPage {
                messages: vec![msg("m1", "A@c.us", 100)],
                has_more: true,
            }),
            Err(FetchError::Http(500)),
        ]);
        let store = MessageStore::new(fetcher.clone(), 50);

        store.load_initial(&chat).await.unwrap();
        let err = store.load_older(&chat).await.unwrap_err();
        assert!(matches!(err, FetchError::Http(500)));

        // Timeline and pagination state survive the failure, and the
        // in-flight flag is released for a retry.
        assert_eq!(store.messages(&chat).len(), 1);
        assert!(store.has_more(&chat));
        assert!(!store.is_loading(&chat));
    }

    #[tokio::test]
    async fn test_overlapping_page_is_deduplicated() {
        let chat = ChatId::new("A@c.us");
        let fetcher = ScriptedFetcher::new(vec![
            Ok(HistoryPage {
                messages: vec![msg("m1", "A@c.us", 100), msg("m2", "A@c.us", 200)],
                has_more: true,
            }),
            // Server returned a page overlapping what we already hold.
            Ok(HistoryPage {
                messages: vec![msg("m0", "A@c.us", 50), msg("m1", "A@c.us", 100)],
                has_more: false,
            }),
        ]);
        let store = MessageStore::new(fetcher, 50);

        store.load_initial(&chat).await.unwrap();
        store.load_older(&chat).await.unwrap();

        let ids: Vec<String> = store.messages(&chat).iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_append_live_dedup_is_idempotent() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let store = MessageStore::new(fetcher, 50);
        let chat = ChatId::new("A@c.us");

        assert!(store.append_live(msg("x", "A@c.us", 10)));
        for _ in 0..5 {
            assert!(!store.append_live(msg("x", "A@c.us", 10)));
        }
        assert_eq!(store.messages(&chat).len(), 1);
    }

    #[tokio::test]
    async fn test_append_live_keeps_timestamps_sorted_and_ties_stable() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let store = MessageStore::new(fetcher, 50);
        let chat = ChatId::new("A@c.us");

        store.append_live(msg("b", "A@c.us", 200));
        store.append_live(msg("a", "A@c.us", 100));
        store.append_live(msg("tie1", "A@c.us", 200));
        store.append_live(msg("tie2", "A@c.us", 200));
        store.append_live(msg("late", "A@c.us", 150));

        let timeline = store.messages(&chat);
        let ids: Vec<&str> = timeline.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "late", "b", "tie1", "tie2"]);
        assert!(
            timeline
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp)
        );
    }

    #[tokio::test]
    async fn test_stale_page_after_release_is_discarded() {
        let chat = ChatId::new("A@c.us");

        // A fetcher that parks until told to finish, so the release can
        // happen while the page request is suspended.
        struct ParkedFetcher {
            gate: AsyncMutex<Option<tokio::sync::oneshot::Receiver<()>>>,
            page: HistoryPage,
        }

        #[async_trait]
        impl HistoryFetcher for ParkedFetcher {
            async fn fetch_page(
                &self,
                _chat_id: &ChatId,
                _limit: u32,
                before: Option<DateTime<Utc>>,
            ) -> Result<HistoryPage, FetchError> {
                if before.is_some() {
                    if let Some(gate) = self.gate.lock().await.take() {
                        let _ = gate.await;
                    }
                }
                Ok(self.page.clone())
            }
        }

        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let fetcher = Arc::new(ParkedFetcher {
            gate: AsyncMutex::new(Some(release_rx)),
            page: HistoryPage {
                messages: vec![msg("m1", "A@c.us", 100)],
                has_more: true,
            },
        });
        let store = Arc::new(MessageStore::new(fetcher, 50));

        store.load_initial(&chat).await.unwrap();

        let older = {
            let store = store.clone();
            let chat = chat.clone();
            tokio::spawn(async move { store.load_older(&chat).await })
        };
        // Let the paging task reach the parked fetch, then drop the chat.
        tokio::task::yield_now().await;
        store.release(&chat);
        let _ = release_tx.send(());

        older.await.unwrap().unwrap();
        // The stale page must not have resurrected the chat.
        assert!(store.messages(&chat).is_empty());
        assert!(!store.is_loaded(&chat));
    }

    #[tokio::test]
    async fn test_concurrent_load_older_is_serialized() {
        let chat = ChatId::new("A@c.us");

        struct SlowFetcher {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl HistoryFetcher for SlowFetcher {
            async fn fetch_page(
                &self,
                _chat_id: &ChatId,
                _limit: u32,
                before: Option<DateTime<Utc>>,
            ) -> Result<HistoryPage, FetchError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if before.is_some() {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(HistoryPage {
                        messages: vec![msg("m0", "A@c.us", 50)],
                        has_more: false,
                    })
                } else {
                    Ok(HistoryPage {
                        messages: vec![msg("m1", "A@c.us", 100)],
                        has_more: true,
                    })
                }
            }
        }

        let fetcher = Arc::new(SlowFetcher {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MessageStore::new(fetcher.clone(), 50));
        store.load_initial(&chat).await.unwrap();

        let first = {
            let store = store.clone();
            let chat = chat.clone();
            tokio::spawn(async move { store.load_older(&chat).await })
        };
        tokio::task::yield_now().await;
        // Second call while the first is outstanding: rejected, no request.
        store.load_older(&chat).await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2); // initial + one older
        assert_eq!(store.messages(&chat).len(), 2);
    }

    #[tokio::test]
    async fn test_mark_delivery_touches_only_outgoing() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let store = MessageStore::new(fetcher, 50);
        let chat = ChatId::new("A@c.us");

        store.append_live(msg("in", "A@c.us", 10));
        let mut out = msg("out", "A@c.us", 20);
        out.direction = Direction::Outgoing;
        out.delivery = Some(DeliveryStatus::Sent);
        store.append_live(out);

        assert!(!store.mark_delivery(&chat, "in", DeliveryStatus::Read));
        assert!(store.mark_delivery(&chat, "out", DeliveryStatus::Delivered));
        let timeline = store.messages(&chat);
        assert_eq!(timeline[1].delivery, Some(DeliveryStatus::Delivered));
    }
}
