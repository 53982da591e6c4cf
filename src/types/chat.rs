use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const INDIVIDUAL_SUFFIX: &str = "@c.us";
const GROUP_SUFFIX: &str = "@g.us";

/// Stable routing key for a chat: `<digits>@c.us` for individuals,
/// `<digits>@g.us` for groups.
///
/// The gateway is not fully consistent about this: acknowledgement payloads
/// carry the bare number without a server suffix, so [`ChatId::new`]
/// normalizes bare numbers to the individual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.contains('@') {
            Self(raw)
        } else {
            Self(format!("{raw}{INDIVIDUAL_SUFFIX}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The display handle: everything before the `@`.
    pub fn handle(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_SUFFIX)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Single sent/delivered/read marker on outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// One entry in a chat timeline.
///
/// Never mutated after insertion, except the delivery marker on outgoing
/// messages. Identity within a timeline is `id`; ordering is `timestamp`
/// (ties keep insertion order).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: ChatId,
    pub direction: Direction,
    /// Sender display name, when the gateway provided one (group senders,
    /// contact names). `None` for our own messages.
    pub sender_label: Option<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub delivery: Option<DeliveryStatus>,
}

/// Directory entry for one chat. The preview fields are the directory's own
/// copy; timelines in the message store are never referenced from here.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ChatId,
    pub name: String,
    pub is_group: bool,
    pub unread_count: u32,
    pub last_message_preview: String,
    pub last_message_at: Option<DateTime<Utc>>,
}
