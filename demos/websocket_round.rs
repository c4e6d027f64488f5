//! # WebSocket Round Example
//!
//! Connects to a round server over WebSocket, joins a room and logs
//! everything that happens until Ctrl+C. Dropped connections are retried
//! with exponential backoff and the room is rejoined automatically.
//!
//! ## Running
//!
//! ```sh
//! # Start a round server on localhost:3536, then:
//! cargo run --example websocket_round
//!
//! # Override the server URL, room and name:
//! ROUND_URL=ws://my-server:3536/ws ROUND_ROOM=ABCD ROUND_NAME=Alice \
//!     cargo run --example websocket_round
//! ```

use std::sync::Arc;

use round_client::event::ConnectionStatus;
use round_client::{
    names, ClientConfig, Event, EventData, MemoryIdentityStore, RoundClient, WebSocketConnector,
};

/// Default server URL when `ROUND_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:3536/ws";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn log_event(event: &Event) {
    match &event.data {
        EventData::PhaseChanged { old, new } => tracing::info!("phase {old} -> {new}"),
        EventData::Connection(ConnectionStatus::Reconnecting { attempt, delay }) => {
            tracing::warn!("reconnecting (attempt {attempt}) in {delay:?}");
        }
        EventData::Connection(status) => tracing::info!("connection: {status:?}"),
        EventData::Timer(timer) => tracing::debug!("{}s left", timer.time_remaining),
        EventData::Error(report) => {
            tracing::error!("[{:?}] {}", report.error_code, report.message);
        }
        other => tracing::debug!("{}: {other:?}", event.name),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = env_or("ROUND_URL", DEFAULT_URL);
    let room = env_or("ROUND_ROOM", "LOBBY");
    let name = env_or("ROUND_NAME", "RustPlayer");
    tracing::info!("Connecting to {url}");

    // ── Start ───────────────────────────────────────────────────────
    let mut client = RoundClient::start(
        ClientConfig::new(),
        Arc::new(WebSocketConnector::new(url)),
        Arc::new(MemoryIdentityStore::new()),
    )?;

    let _subscriptions: Vec<_> = [
        names::PHASE_CHANGED,
        names::CONNECTION_CONNECTED,
        names::CONNECTION_DISCONNECTED,
        names::CONNECTION_RECONNECTING,
        names::CONNECTION_FAILED,
        names::TIMER_UPDATE,
        names::SYSTEM_ERROR,
        names::GAME_PAUSED,
    ]
    .into_iter()
    .map(|event| {
        client.events().subscribe(event, |event: &Event| {
            log_event(event);
            Ok(())
        })
    })
    .collect();

    // Deferred until the connection is up.
    client.join_room(room, name);

    // ── Wait ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down…");

    // ── Cleanup ─────────────────────────────────────────────────────
    client.shutdown().await;
    tracing::info!("Client shut down. Goodbye!");
    Ok(())
}
