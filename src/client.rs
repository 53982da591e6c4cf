use crate::config::ClientConfig;
use crate::conn::{ConnectionManager, Subscription};
use crate::error::{ClientError, FetchError};
use crate::history::HistoryFetcher;
use crate::store::{ChatDirectory, MessageStore};
use crate::transport::TransportFactory;
use crate::types::chat::{ChatId, Conversation, DeliveryStatus, Direction, Message};
use crate::types::events::{
    ConnectionStatus, GatewayAction, GatewayEvent, SendMessageRequest, SessionEvent,
};
use chrono::{DateTime, Utc};
use log::warn;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::watch;

/// Identifier source for live messages the gateway did not assign an id to.
///
/// Ids are `<prefix>-<nonce>-<millis>-<seq>`: the monotonic counter makes
/// them unique within a processing batch, the random per-session nonce keeps
/// them distinct across reconnects. Gateway-assigned ids are always preferred
/// when present.
struct LiveIdSource {
    nonce: String,
    seq: AtomicU64,
}

impl LiveIdSource {
    fn new() -> Self {
        let mut nonce_bytes = [0u8; 2];
        rand::rng().fill_bytes(&mut nonce_bytes);
        Self {
            nonce: format!("{}.{}", nonce_bytes[0], nonce_bytes[1]),
            seq: AtomicU64::new(0),
        }
    }

    fn next(&self, prefix: &str, timestamp: DateTime<Utc>) -> String {
        format!(
            "{prefix}-{}-{}-{}",
            self.nonce,
            timestamp.timestamp_millis(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        )
    }
}

/// One console session: wires the connection manager's output into the
/// message store and the chat directory, and applies focus to gate unread
/// accounting.
///
/// Explicitly constructed and passed by reference; there is no ambient
/// session. Tests build one against fake transport and history
/// implementations.
pub struct Client {
    conn: Arc<ConnectionManager>,
    messages: Arc<MessageStore>,
    chats: Arc<ChatDirectory>,
    focused: Arc<StdMutex<Option<ChatId>>>,
    live_ids: Arc<LiveIdSource>,
    routing: StdMutex<Option<Subscription>>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        fetcher: Arc<dyn HistoryFetcher>,
    ) -> Arc<Self> {
        let conn = ConnectionManager::new(config.clone(), transport_factory);
        Arc::new(Self {
            conn,
            messages: Arc::new(MessageStore::new(fetcher, config.history_page_size)),
            chats: Arc::new(ChatDirectory::new()),
            focused: Arc::new(StdMutex::new(None)),
            live_ids: Arc::new(LiveIdSource::new()),
            routing: StdMutex::new(None),
        })
    }

    /// Opens the realtime channel. Idempotent.
    pub async fn open(&self) {
        self.ensure_routing();
        self.conn.open().await;
    }

    /// Closes the channel and drops all subscriptions (including the
    /// session's own routing, which `open` re-installs). Idempotent.
    pub async fn close(&self) {
        self.conn.close().await;
        if let Ok(mut slot) = self.routing.lock() {
            *slot = None;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.conn.status_watch()
    }

    pub fn last_error(&self) -> Option<String> {
        self.conn.last_error()
    }

    /// See [`ConnectionManager::subscribe`].
    pub fn subscribe(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.conn.subscribe(handler)
    }

    /// Marks a chat as the one the operator is looking at and clears its
    /// unread counter. Does not cancel in-flight page loads for the
    /// previously focused chat; their responses stay valid as long as the
    /// chat remains loaded.
    pub fn focus(&self, chat_id: &ChatId) {
        if let Ok(mut focused) = self.focused.lock() {
            *focused = Some(chat_id.clone());
        }
        self.chats.clear_unread(chat_id);
    }

    pub fn blur(&self) {
        if let Ok(mut focused) = self.focused.lock() {
            *focused = None;
        }
    }

    pub fn focused(&self) -> Option<ChatId> {
        self.focused.lock().map(|f| (*f).clone()).unwrap_or(None)
    }

    pub async fn send_message(&self, to: &ChatId, body: &str) -> Result<(), ClientError> {
        self.conn
            .send(&GatewayAction::SendMessage(SendMessageRequest {
                number: to.as_str().to_string(),
                message: body.to_string(),
            }))
            .await
    }

    /// Requests a fresh directory snapshot from the gateway.
    pub async fn refresh_chats(&self) -> Result<(), ClientError> {
        self.conn.send(&GatewayAction::GetChats).await
    }

    pub async fn load_initial(&self, chat_id: &ChatId) -> Result<(), FetchError> {
        self.messages.load_initial(chat_id).await
    }

    pub async fn load_older(&self, chat_id: &ChatId) -> Result<(), FetchError> {
        self.messages.load_older(chat_id).await
    }

    pub fn release(&self, chat_id: &ChatId) -> bool {
        self.messages.release(chat_id)
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.messages.messages(chat_id)
    }

    pub fn has_more(&self, chat_id: &ChatId) -> bool {
        self.messages.has_more(chat_id)
    }

    pub fn is_loading(&self, chat_id: &ChatId) -> bool {
        self.messages.is_loading(chat_id)
    }

    pub fn chats(&self) -> Vec<Conversation> {
        self.chats.snapshot()
    }

    pub fn conversation(&self, chat_id: &ChatId) -> Option<Conversation> {
        self.chats.conversation(chat_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.chats.total_unread()
    }

    /// Installs the event-routing subscription if it is not already in
    /// place. `close` tears all registrations down, so this runs on every
    /// `open`.
    fn ensure_routing(&self) {
        let Ok(mut slot) = self.routing.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let conn = Arc::downgrade(&self.conn);
        let messages = self.messages.clone();
        let chats = self.chats.clone();
        let focused = self.focused.clone();
        let live_ids = self.live_ids.clone();

        let subscription = self.conn.subscribe(move |event| match event {
            SessionEvent::StatusChanged(ConnectionStatus::Ready) => {
                Self::request_chat_list(&conn);
            }
            SessionEvent::StatusChanged(_) => {}
            SessionEvent::Gateway(gateway_event) => {
                Self::route_gateway_event(gateway_event, &messages, &chats, &focused, &live_ids);
            }
        });
        *slot = Some(subscription);
    }

    /// The directory snapshot is refreshed on every ready transition, not
    /// just the first one: a relink may have happened on the gateway side.
    fn request_chat_list(conn: &Weak<ConnectionManager>) {
        let Some(conn) = conn.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = conn.send(&GatewayAction::GetChats).await {
                warn!(target: "Client", "Failed to request chat list: {e}");
            }
        });
    }

    fn route_gateway_event(
        event: &GatewayEvent,
        messages: &MessageStore,
        chats: &ChatDirectory,
        focused: &StdMutex<Option<ChatId>>,
        live_ids: &LiveIdSource,
    ) {
        match event {
            GatewayEvent::Message(incoming) => {
                let chat_id = ChatId::new(incoming.number.as_str());
                let timestamp =
                    DateTime::from_timestamp(incoming.timestamp, 0).unwrap_or_else(Utc::now);
                let id = incoming
                    .message_id
                    .clone()
                    .unwrap_or_else(|| live_ids.next("recv", timestamp));
                let is_focused = focused
                    .lock()
                    .map(|f| f.as_ref() == Some(&chat_id))
                    .unwrap_or(false);

                messages.append_live(Message {
                    id,
                    chat_id: chat_id.clone(),
                    direction: Direction::Incoming,
                    sender_label: Some(incoming.from.clone()),
                    body: incoming.body.clone(),
                    timestamp,
                    is_group: incoming.is_group,
                    delivery: None,
                });
                chats.record_incoming(incoming, is_focused);
            }
            GatewayEvent::MessageSent(ack) => {
                if !ack.success {
                    warn!(target: "Client", "Gateway rejected message to {}", ack.to);
                    return;
                }
                let chat_id = ChatId::new(ack.to.as_str());
                let timestamp = Utc::now();
                let id = ack
                    .message_id
                    .clone()
                    .unwrap_or_else(|| live_ids.next("sent", timestamp));

                let inserted = messages.append_live(Message {
                    id,
                    chat_id: chat_id.clone(),
                    direction: Direction::Outgoing,
                    sender_label: None,
                    body: ack.message.clone(),
                    timestamp,
                    is_group: chat_id.is_group(),
                    delivery: Some(DeliveryStatus::Sent),
                });
                // A retransmitted confirmation must not touch the directory
                // a second time either.
                if inserted {
                    chats.record_outgoing(&chat_id, &ack.message, timestamp);
                }
            }
            GatewayEvent::ChatsList(list) => {
                chats.replace_all(list);
            }
            // Lifecycle events are reflected in the status value by the
            // connection manager; nothing to store here.
            GatewayEvent::Qr(_)
            | GatewayEvent::Ready(_)
            | GatewayEvent::Authenticated
            | GatewayEvent::AuthFailure(_)
            | GatewayEvent::Disconnected(_)
            | GatewayEvent::Error(_) => {}
        }
    }
}
