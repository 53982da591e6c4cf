use std::time::Duration;

/// Session configuration. One instance per [`Client`](crate::client::Client);
/// there is no ambient/global configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket endpoint of the realtime gateway.
    pub gateway_url: String,
    /// Base URL of the gateway's HTTP API (history pages, statistics).
    pub api_url: String,
    /// Bearer token sent on the WebSocket upgrade and on HTTP requests.
    pub auth_token: Option<String>,
    /// Fixed delay between automatic reopen attempts.
    pub reconnect_delay: Duration,
    /// Automatic reopen attempts after an unexpected closure before settling
    /// in the terminal error state.
    pub max_reconnect_attempts: u32,
    /// Messages per history page.
    pub history_page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:3000/ws".to_string(),
            api_url: "http://localhost:3000".to_string(),
            auth_token: None,
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            history_page_size: 50,
        }
    }
}
