//! Event payloads carried by the [`EventDispatcher`](crate::dispatcher::EventDispatcher).
//!
//! Every broadcast is an [`Event`]: a name from [`names`], an [`EventData`]
//! payload and an optional source label. UI collaborators subscribe by name
//! and match on the payload variant they expect.

use std::time::Duration;

use serde::Serialize;

use crate::error_codes::ErrorCode;
use crate::protocol::PauseInfo;
use crate::session::{Phase, RoomInfo, SessionState};

/// Event names used across the client.
pub mod names {
    /// The session phase changed. Payload: [`EventData::PhaseChanged`](super::EventData::PhaseChanged).
    pub const PHASE_CHANGED: &str = "phase-changed";
    /// The session state changed. Payload: [`EventData::StateChanged`](super::EventData::StateChanged).
    pub const STATE_CHANGED: &str = "state-changed";
    /// A submission guard was set.
    pub const USER_ACTION: &str = "user-action";

    pub const TIMER_UPDATE: &str = "timer:update";
    pub const TIMER_EXPIRED: &str = "timer:expired";

    /// Something went wrong that the user may want to know about.
    pub const SYSTEM_ERROR: &str = "system:error";

    pub const CONNECTION_CONNECTED: &str = "connection:connected";
    pub const CONNECTION_DISCONNECTED: &str = "connection:disconnected";
    pub const CONNECTION_ERROR: &str = "connection:error";
    pub const CONNECTION_RECONNECTING: &str = "connection:reconnecting";
    /// Recovery gave up after the configured number of attempts.
    pub const CONNECTION_FAILED: &str = "connection:failed";

    pub const ROOM_JOINED: &str = "room:joined";
    pub const ROOM_LEFT: &str = "room:left";
    /// Payload: [`EventData::Paused`](super::EventData::Paused).
    pub const GAME_PAUSED: &str = "game:paused";

    // User intents, published by UI collaborators.
    pub const USER_RESPONSE_SUBMITTED: &str = "user:response:submitted";
    pub const USER_GUESS_SUBMITTED: &str = "user:guess:submitted";
    pub const USER_ROUND_START: &str = "user:round:start";
    pub const USER_ROOM_JOIN: &str = "user:room:join";
    pub const USER_ROOM_LEAVE: &str = "user:room:leave";
}

/// A named broadcast.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub data: EventData,
    /// Component that published the event, if it said.
    pub source: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: EventData) -> Self {
        Self {
            name: name.into(),
            data,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The session state, for `state-changed` events.
    pub fn state(&self) -> Option<&SessionState> {
        match &self.data {
            EventData::StateChanged(state) => Some(state),
            _ => None,
        }
    }

    /// The user intent, for `user:*` events.
    pub fn intent(&self) -> Option<&UserIntent> {
        match &self.data {
            EventData::Intent(intent) => Some(intent),
            _ => None,
        }
    }
}

/// Payload of an [`Event`].
#[derive(Debug, Clone)]
pub enum EventData {
    None,
    PhaseChanged { old: Phase, new: Phase },
    StateChanged(Box<SessionState>),
    UserAction(UserAction),
    Intent(UserIntent),
    Connection(ConnectionStatus),
    Timer(TimerUpdate),
    Error(ErrorReport),
    Room(RoomInfo),
    Paused(PauseInfo),
}

/// A guard that was just set by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    ResponseSubmitted { text: String },
    GuessSubmitted { index: usize },
}

/// Something the user asked for, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    JoinRoom { room_id: String, player_name: String },
    LeaveRoom,
    StartRound,
    SubmitResponse { text: String },
    /// `index` refers to the position in `SessionState::responses`.
    SubmitGuess { index: usize },
}

impl UserIntent {
    /// The event name this intent is published under.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => names::USER_ROOM_JOIN,
            Self::LeaveRoom => names::USER_ROOM_LEAVE,
            Self::StartRound => names::USER_ROUND_START,
            Self::SubmitResponse { .. } => names::USER_RESPONSE_SUBMITTED,
            Self::SubmitGuess { .. } => names::USER_GUESS_SUBMITTED,
        }
    }
}

/// Transport lifecycle as seen by UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// `attempt` is 0 for the initial connection.
    Connected { attempt: u32 },
    Disconnected { reason: Option<String> },
    Error { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

/// Countdown progress for the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerUpdate {
    pub phase: Phase,
    pub time_remaining: u32,
    pub phase_duration: Option<u32>,
}

/// A user-visible error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub error_code: Option<ErrorCode>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
        }
    }
}
