#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for round client integration tests.
//!
//! Provides a channel-backed [`MockTransport`] driven through a
//! [`ServerHandle`], a [`MockConnector`] that hands out scripted connections,
//! and helpers for building server frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use round_client::error_codes::ErrorCode;
use round_client::protocol::{PauseInfo, ResultsPayload, RoomJoinedPayload};
use round_client::session::{Player, Prompt, Response};
use round_client::{
    ClientError, ClientMessage, Connector, Event, EventDispatcher, ServerMessage, Subscription,
    Transport,
};
use tokio::sync::mpsc;

type Frame = Option<Result<String, ClientError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// A channel-based mock transport for integration testing.
///
/// Frames pushed through the paired [`ServerHandle`] are yielded by `recv()`
/// in order; once the handle has nothing queued, `recv()` waits. Every
/// message sent by the client is recorded.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

/// The server side of a [`MockTransport`].
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Frame>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a transport plus the handle that drives it.
    pub fn pair() -> (Self, ServerHandle) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (transport, ServerHandle { tx, sent, closed })
    }

    /// Create a transport preloaded with `frames`.
    pub fn scripted(frames: Vec<String>) -> (Self, ServerHandle) {
        let (transport, server) = Self::pair();
        for frame in frames {
            server.push(frame);
        }
        (transport, server)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), ClientError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        match self.incoming.recv().await {
            Some(frame) => frame,
            // Handle dropped: stay silent until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl ServerHandle {
    /// Deliver one frame to the client.
    pub fn push(&self, frame: String) {
        let _ = self.tx.send(Some(Ok(frame)));
    }

    /// Close the connection cleanly from the server side.
    pub fn disconnect(&self) {
        let _ = self.tx.send(None);
    }

    /// Fail the connection with a receive error.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .tx
            .send(Some(Err(ClientError::TransportReceive(reason.into()))));
    }

    /// Every message the client has sent, decoded.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("client sent invalid JSON"))
            .collect()
    }

    /// Sent messages other than heartbeat pings.
    pub fn sent_without_pings(&self) -> Vec<ClientMessage> {
        self.sent()
            .into_iter()
            .filter(|msg| *msg != ClientMessage::Ping)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the next `connect()` call does.
pub enum ConnectPlan {
    Accept(MockTransport),
    Refuse(String),
    /// Never completes; only the connect timeout ends it.
    Hang,
}

/// Hands out scripted connections in order. Refuses once the script runs out.
pub struct MockConnector {
    plans: StdMutex<VecDeque<ConnectPlan>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new(plans: Vec<ConnectPlan>) -> Arc<Self> {
        Arc::new(Self {
            plans: StdMutex::new(VecDeque::from(plans)),
            attempts: AtomicUsize::new(0),
        })
    }

    /// A connector whose single connection is driven by the returned handle.
    pub fn single() -> (Arc<Self>, ServerHandle) {
        let (transport, server) = MockTransport::pair();
        (Self::new(vec![ConnectPlan::Accept(transport)]), server)
    }

    /// Number of `connect()` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let plan = self.plans.lock().unwrap().pop_front();
        match plan {
            Some(ConnectPlan::Accept(transport)) => Ok(Box::new(transport)),
            Some(ConnectPlan::Refuse(reason)) => Err(ClientError::Connect(reason)),
            Some(ConnectPlan::Hang) => std::future::pending().await,
            None => Err(ClientError::Connect("no more scripted connections".into())),
        }
    }
}

// ── Event recording ─────────────────────────────────────────────────

/// Records every event published under `names`, in order.
pub struct EventLog {
    events: Arc<StdMutex<Vec<Event>>>,
    _subscriptions: Vec<Subscription>,
}

impl EventLog {
    pub fn attach(dispatcher: &EventDispatcher, names: &[&str]) -> Self {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let subscriptions = names
            .iter()
            .map(|name| {
                let sink = Arc::clone(&events);
                dispatcher.subscribe(name, move |event: &Event| {
                    sink.lock().unwrap().push(event.clone());
                    Ok(())
                })
            })
            .collect();
        Self {
            events,
            _subscriptions: subscriptions,
        }
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Events named `name`, in order.
    pub fn named(&self, name: &str) -> Vec<Event> {
        self.all()
            .into_iter()
            .filter(|event| event.name == name)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.named(name).len()
    }

    pub fn names(&self) -> Vec<String> {
        self.all().into_iter().map(|event| event.name).collect()
    }
}

/// Poll `condition` until it holds, panicking after `limit`.
///
/// Works under a paused clock: each poll sleeps, which lets time advance.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── JSON helper functions ───────────────────────────────────────────

pub fn player(id: &str, name: &str) -> Player {
    Player {
        id: id.into(),
        name: name.into(),
        connected: true,
        score: 0,
    }
}

fn to_json(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).expect("server message serialization")
}

/// `room_joined` for `player_id` in `room_id`, with `others` already present.
pub fn room_joined_json(room_id: &str, player_id: &str, name: &str, others: &[Player]) -> String {
    let mut players = vec![player(player_id, name)];
    players.extend_from_slice(others);
    let count = u32::try_from(players.len()).unwrap();
    to_json(&ServerMessage::RoomJoined(Box::new(RoomJoinedPayload {
        room_id: room_id.into(),
        player_id: player_id.into(),
        player_name: name.into(),
        players,
        connected_count: count,
        total_count: count,
        game_state: None,
    })))
}

pub fn round_started_json(round_number: u32, prompt: &str, phase_duration: u32) -> String {
    to_json(&ServerMessage::RoundStarted {
        round_number,
        prompt: Prompt::new(prompt),
        phase_duration: Some(phase_duration),
    })
}

pub fn guessing_json(responses: &[&str], phase_duration: u32) -> String {
    to_json(&ServerMessage::GuessingPhaseStarted {
        responses: responses.iter().map(|text| Response::new(*text)).collect(),
        phase_duration: Some(phase_duration),
    })
}

pub fn results_json(players: Vec<Player>) -> String {
    to_json(&ServerMessage::ResultsPhaseStarted(Box::new(ResultsPayload {
        responses: None,
        players,
        phase_duration: Some(10),
    })))
}

pub fn countdown_json(time_remaining: u32) -> String {
    to_json(&ServerMessage::CountdownUpdate { time_remaining })
}

pub fn game_paused_json(reason: &str) -> String {
    to_json(&ServerMessage::GamePaused(Some(PauseInfo {
        reason: Some(reason.into()),
    })))
}

pub fn player_joined_json(id: &str, name: &str) -> String {
    to_json(&ServerMessage::PlayerJoined {
        player: player(id, name),
    })
}

pub fn player_left_json(id: &str) -> String {
    to_json(&ServerMessage::PlayerLeft {
        player_id: id.into(),
    })
}

pub fn error_json(message: &str, error_code: Option<ErrorCode>) -> String {
    to_json(&ServerMessage::Error {
        message: message.into(),
        error_code,
    })
}

pub fn pong_json() -> String {
    to_json(&ServerMessage::Pong)
}
