use thiserror::Error;

/// Failures of the realtime connection surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("failed to encode action: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport send failed: {0}")]
    Transport(anyhow::Error),
}

/// A history page request failed. Returned to the caller as a value; the
/// in-memory state for the chat is left exactly as it was before the call.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("history endpoint returned status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed history payload: {0}")]
    Decode(#[from] serde_json::Error),
}
