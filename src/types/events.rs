use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the realtime gateway connection.
///
/// There is exactly one current value per session, owned by the
/// [`ConnectionManager`](crate::conn::ConnectionManager); everything else
/// observes it through `status()` or a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    /// A link challenge was received; the operator has to complete the
    /// pairing ceremony before the channel becomes usable.
    AwaitingLink,
    Ready,
    /// Transient: the linking ceremony completed but the channel has not yet
    /// confirmed it is open. Immediately followed by `Ready`.
    Authenticated,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::AwaitingLink => "awaiting-link",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Authenticated => "authenticated",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inbound event from the gateway, decoded from a JSON text frame of the
/// form `{"event": "...", "data": ...}`.
///
/// This is a closed union: adding an event kind is a compile-time-checked
/// change, and every consumer dispatches with an exhaustive `match`. Frames
/// whose `event` name is unknown fail deserialization and are dropped with a
/// warning at the connection boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// Link challenge payload, rendered by the operator UI for scanning.
    Qr(String),
    Ready(ReadyInfo),
    Authenticated,
    #[serde(rename = "auth_failure")]
    AuthFailure(String),
    /// The upstream channel closed, with the gateway's reason string.
    Disconnected(String),
    Message(IncomingMessage),
    MessageSent(MessageSentAck),
    ChatsList(Vec<ChatSummary>),
    Error(ErrorInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyInfo {
    pub message: String,
}

/// Inbound chat message pushed over the live channel. `number` is the
/// conversation id; `message_id` is absent on some gateway versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub from: String,
    pub number: String,
    pub body: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub is_group: bool,
    pub chat_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Outbound delivery confirmation. `to` carries the bare number, without the
/// `@c.us` suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentAck {
    pub success: bool,
    pub to: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// One entry of the bulk `chatsList` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub unread_count: u32,
    pub last_message: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

/// Outbound action request, encoded onto the channel as
/// `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum GatewayAction {
    GetChats,
    SendMessage(SendMessageRequest),
    /// Channel-based history request, for gateways without the HTTP history
    /// endpoint.
    GetMessages(HistoryRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub number: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub chat_id: String,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<i64>,
}

/// What subscribers receive: every status change and every raw inbound event,
/// in arrival order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    Gateway(GatewayEvent),
}
