pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod history;
pub mod store;
pub mod transport;
pub mod types;

pub use client::Client;
pub use config::ClientConfig;
pub use conn::{ConnectionManager, Subscription};
pub use error::{ClientError, FetchError};
pub use history::{GatewayStats, HistoryFetcher, HistoryPage, HttpHistoryClient};
pub use transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};
pub use types::chat::{ChatId, Conversation, DeliveryStatus, Direction, Message};
pub use types::events::{ConnectionStatus, GatewayAction, GatewayEvent, SessionEvent};
