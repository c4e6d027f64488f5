//! # Loopback Round Example
//!
//! Plays one full round against an in-process fake server:
//!
//! 1. Implement [`Transport`] and [`Connector`] over in-process channels
//! 2. Start a [`RoundClient`] and join a room
//! 3. React to phase changes by starting the round, responding and guessing
//! 4. Shut down once results are in
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_round
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use round_client::event::ConnectionStatus;
use round_client::{
    names, ClientConfig, ClientError, ClientMessage, Connector, Event, EventData,
    MemoryIdentityStore, Phase, RoundClient, Transport,
};
use serde_json::json;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based "loopback" transport and its connector
// ─────────────────────────────────────────────────────────────────────

/// Client half of the loopback.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Server half of the loopback.
pub struct LoopbackServer {
    pub rx: mpsc::UnboundedReceiver<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

fn loopback_pair() -> (LoopbackTransport, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        },
        LoopbackServer {
            rx: server_rx,
            tx: server_tx,
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), ClientError> {
        self.tx
            .send(message)
            .map_err(|e| ClientError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Hands out the single loopback connection, then refuses.
struct LoopbackConnector {
    transport: Mutex<Option<LoopbackTransport>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        match self.transport.lock().take() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(ClientError::Connect("loopback already used".into())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A fake server that plays one round
// ─────────────────────────────────────────────────────────────────────

async fn fake_server(mut server: LoopbackServer) {
    let send = |value: serde_json::Value| {
        let _ = server.tx.send(value.to_string());
    };

    while let Some(raw) = server.rx.recv().await {
        let Ok(msg) = serde_json::from_str::<ClientMessage>(&raw) else {
            tracing::warn!("server: unreadable frame {raw}");
            continue;
        };
        tracing::info!("server received: {msg:?}");

        match msg {
            ClientMessage::JoinRoom {
                room_id,
                player_name,
            } => send(json!({
                "type": "room_joined",
                "data": {
                    "room_id": room_id,
                    "player_id": "p-1",
                    "player_name": player_name,
                    "players": [
                        {"id": "p-1", "name": player_name},
                        {"id": "p-2", "name": "Bot"}
                    ]
                }
            })),
            ClientMessage::StartRound => send(json!({
                "type": "round_started",
                "data": {"round_number": 1, "prompt": {"text": "Name a color"}, "phase_duration": 60}
            })),
            ClientMessage::SubmitResponse { response } => send(json!({
                "type": "guessing_phase_started",
                "data": {"responses": ["teal", response], "phase_duration": 30}
            })),
            ClientMessage::SubmitGuess { guess_index } => send(json!({
                "type": "results_phase_started",
                "data": {
                    "players": [
                        {"id": "p-1", "name": "RustPlayer", "score": if guess_index == 0 { 1 } else { 0 }},
                        {"id": "p-2", "name": "Bot", "score": 1}
                    ]
                }
            })),
            ClientMessage::LeaveRoom => break,
            ClientMessage::Ping => send(json!({"type": "pong"})),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Drive the client from its events
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (transport, server) = loopback_pair();
    tokio::spawn(fake_server(server));

    let connector = Arc::new(LoopbackConnector {
        transport: Mutex::new(Some(transport)),
    });
    let mut client = RoundClient::start(
        ClientConfig::new().with_max_reconnect_attempts(0),
        connector,
        Arc::new(MemoryIdentityStore::new()),
    )?;

    // Forward the events we care about into a channel the main task awaits.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let _subscriptions: Vec<_> = [
        names::ROOM_JOINED,
        names::PHASE_CHANGED,
        names::SYSTEM_ERROR,
        names::CONNECTION_FAILED,
    ]
    .into_iter()
    .map(|name| {
        let tx = event_tx.clone();
        client.events().subscribe(name, move |event: &Event| {
            tx.send(event.clone())?;
            Ok(())
        })
    })
    .collect();

    client.join_room("LOOP1", "RustPlayer");

    while let Some(event) = event_rx.recv().await {
        match (event.name.as_str(), &event.data) {
            (names::ROOM_JOINED, EventData::Room(room)) => {
                tracing::info!(
                    "joined {} with {} player(s)",
                    room.room_id.as_deref().unwrap_or("?"),
                    room.connected_count
                );
                client.start_round();
            }
            (names::PHASE_CHANGED, EventData::PhaseChanged { new, .. }) => match new {
                Phase::Responding => {
                    let state = client.session().snapshot();
                    if let Some(prompt) = state.prompt {
                        tracing::info!("prompt: {}", prompt.text);
                    }
                    client.submit_response("crimson");
                }
                Phase::Guessing => {
                    let choices = client.session().visible_responses();
                    tracing::info!("choices (own response hidden): {choices:?}");
                    if let Some((_, index)) = choices.first() {
                        client.submit_guess(*index);
                    }
                }
                Phase::Results => {
                    for player in client.session().snapshot().players {
                        tracing::info!("{}: {} point(s)", player.name, player.score);
                    }
                    break;
                }
                Phase::Waiting => {}
            },
            (names::SYSTEM_ERROR, EventData::Error(report)) => {
                tracing::error!("error: {}", report.message);
            }
            (_, EventData::Connection(ConnectionStatus::Failed { attempts })) => {
                tracing::error!("gave up after {attempts} attempt(s)");
                break;
            }
            _ => {}
        }
    }

    client.leave_room();
    client.shutdown().await;
    tracing::info!("Done. The loopback round completed.");
    Ok(())
}
