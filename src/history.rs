use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::types::chat::{ChatId, Direction, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One page of history for a chat, oldest message first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Request/response endpoint returning one page of historical messages for a
/// chat, strictly older than `before` when a cursor is given.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<HistoryPage, FetchError>;
}

// Unused wire fields (chatId, count, to, chatName) are left to serde's
// unknown-key handling.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHistory {
    messages: Vec<WireMessage>,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: String,
    direction: Direction,
    from: String,
    body: String,
    /// Unix milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    is_group: bool,
    #[serde(default)]
    contact_name: Option<String>,
}

impl WireMessage {
    fn into_message(self, chat_id: &ChatId) -> Message {
        let sender_label = match self.direction {
            Direction::Incoming => self.contact_name.or(Some(self.from)),
            Direction::Outgoing => None,
        };
        Message {
            id: self.id,
            chat_id: chat_id.clone(),
            direction: self.direction,
            sender_label,
            body: self.body,
            timestamp: self.timestamp,
            is_group: self.is_group,
            delivery: None,
        }
    }
}

/// Gateway-side statistics, shown on the console dashboard.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_messages: u64,
    pub total_chats: u64,
    pub incoming_count: u64,
    pub outgoing_count: u64,
    pub whatsapp_connected: bool,
}

/// History and statistics client for the gateway's HTTP API.
///
/// `ureq` is blocking, so requests are wrapped in `spawn_blocking`. Plain
/// request/response; retries are the caller's affair.
#[derive(Debug, Clone)]
pub struct HttpHistoryClient {
    api_url: String,
    auth_token: Option<String>,
}

impl HttpHistoryClient {
    pub fn new(api_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            api_url: api_url.into(),
            auth_token,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.api_url.clone(), config.auth_token.clone())
    }

    pub async fn fetch_stats(&self) -> Result<GatewayStats, FetchError> {
        let url = format!("{}/api/stats", self.api_url);
        let body = self.get(url).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get(&self, url: String) -> Result<Vec<u8>, FetchError> {
        let token = self.auth_token.clone();
        tokio::task::spawn_blocking(move || blocking_get(&url, token.as_deref()))
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
    }
}

#[async_trait]
impl HistoryFetcher for HttpHistoryClient {
    async fn fetch_page(
        &self,
        chat_id: &ChatId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<HistoryPage, FetchError> {
        let mut url = format!(
            "{}/api/messages/{}?limit={}",
            self.api_url,
            urlencoding::encode(chat_id.as_str()),
            limit
        );
        if let Some(before) = before {
            url.push_str(&format!("&before={}", before.timestamp_millis()));
        }

        let body = self.get(url).await?;
        let wire: WireHistory = serde_json::from_slice(&body)?;
        let chat_id = chat_id.clone();
        Ok(HistoryPage {
            messages: wire
                .messages
                .into_iter()
                .map(|m| m.into_message(&chat_id))
                .collect(),
            has_more: wire.has_more,
        })
    }
}

fn blocking_get(url: &str, token: Option<&str>) -> Result<Vec<u8>, FetchError> {
    let mut req = ureq::get(url);
    if let Some(token) = token {
        req = req.header("Authorization", &format!("Bearer {token}"));
    }
    let response = req.call().map_err(|e| match e {
        ureq::Error::StatusCode(code) => FetchError::Http(code),
        other => FetchError::Network(other.to_string()),
    })?;

    let mut body = response.into_body();
    body.read_to_vec()
        .map_err(|e| FetchError::Network(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_history_page() {
        let raw = r#"{
            "chatId": "123@c.us",
            "messages": [
                {"id":"m1","direction":"incoming","from":"Alice","to":"me","body":"hi","timestamp":100000,"isGroup":false,"contactName":"Alice"},
                {"id":"m2","direction":"outgoing","from":"me","to":"123","body":"yo","timestamp":200000,"isGroup":false}
            ],
            "hasMore": true,
            "count": 2
        }"#;
        let wire: WireHistory = serde_json::from_str(raw).unwrap();
        assert!(wire.has_more);

        let chat_id = ChatId::new("123@c.us");
        let messages: Vec<Message> = wire
            .messages
            .into_iter()
            .map(|m| m.into_message(&chat_id))
            .collect();
        assert_eq!(messages[0].sender_label.as_deref(), Some("Alice"));
        assert_eq!(messages[0].timestamp.timestamp_millis(), 100_000);
        assert_eq!(messages[1].direction, Direction::Outgoing);
        assert!(messages[1].sender_label.is_none());
    }

    #[test]
    fn test_decode_stats() {
        let raw = r#"{"totalMessages":10,"totalChats":3,"incomingCount":6,"outgoingCount":4,"whatsappConnected":true}"#;
        let stats: GatewayStats = serde_json::from_str(raw).unwrap();
        assert_eq!(stats.total_messages, 10);
        assert!(stats.whatsapp_connected);
    }
}
