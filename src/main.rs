use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use waconsole::{
    Client, ClientConfig, GatewayEvent, HttpHistoryClient, SessionEvent, WebSocketTransportFactory,
};

/// Terminal monitor for a WhatsApp gateway: connects the realtime channel,
/// prints lifecycle transitions, link challenges and chat traffic.
#[derive(Parser, Debug)]
#[command(name = "waconsole", version, about)]
struct Args {
    /// WebSocket endpoint of the gateway.
    #[arg(long, default_value = "ws://localhost:3000/ws")]
    gateway_url: String,

    /// Base URL of the gateway HTTP API (history, statistics).
    #[arg(long, default_value = "http://localhost:3000")]
    api_url: String,

    /// Bearer token for the gateway.
    #[arg(long)]
    token: Option<String>,

    /// Print gateway statistics after connecting.
    #[arg(long)]
    stats: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(run(args));
}

async fn run(args: Args) {
    let config = ClientConfig {
        gateway_url: args.gateway_url,
        api_url: args.api_url,
        auth_token: args.token,
        ..Default::default()
    };

    let transport_factory = Arc::new(WebSocketTransportFactory::new(
        config.gateway_url.clone(),
        config.auth_token.clone(),
    ));
    let api = Arc::new(HttpHistoryClient::from_config(&config));
    let client = Client::new(config, transport_factory, api.clone());

    let _console_sub = client.subscribe(|event| match event {
        SessionEvent::StatusChanged(status) => {
            info!(target: "Console", "Connection status: {status}");
        }
        SessionEvent::Gateway(GatewayEvent::Qr(code)) => {
            info!(target: "Console", "----------------------------------------");
            info!(target: "Console", "Link challenge received, pair the device:");
            info!(target: "Console", "\n{code}\n");
            info!(target: "Console", "----------------------------------------");
        }
        SessionEvent::Gateway(GatewayEvent::Message(m)) => {
            info!(target: "Console", "[{}] {}: {}", m.chat_name, m.from, m.body);
        }
        SessionEvent::Gateway(GatewayEvent::MessageSent(ack)) => {
            info!(target: "Console", "Delivered to {}: {}", ack.to, ack.message);
        }
        SessionEvent::Gateway(GatewayEvent::ChatsList(chats)) => {
            info!(target: "Console", "Chat list updated ({} chats)", chats.len());
        }
        SessionEvent::Gateway(GatewayEvent::Disconnected(reason)) => {
            warn!(target: "Console", "Gateway lost its upstream session: {reason}");
        }
        SessionEvent::Gateway(_) => {}
    });

    client.open().await;

    if args.stats {
        match api.fetch_stats().await {
            Ok(stats) => info!(
                target: "Console",
                "Gateway stats: {} messages across {} chats ({} in / {} out), upstream connected: {}",
                stats.total_messages,
                stats.total_chats,
                stats.incoming_count,
                stats.outgoing_count,
                stats.whatsapp_connected
            ),
            Err(e) => error!(target: "Console", "Failed to fetch statistics: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "Console", "Failed to listen for shutdown signal: {e}");
    }
    info!(target: "Console", "Shutting down");
    client.close().await;
}
