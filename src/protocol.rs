//! Wire types for the round protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"type": "<snake_case_name>", "data": {...}}`; unit messages omit `data`.
//! The `type` values match the event names the server emits and accepts
//! (`join_room`, `round_started`, ...).
//!
//! Transport lifecycle (`connect`, `disconnect`, `connect_error`) is not a
//! frame: it is reported by the [`Transport`](crate::Transport) and
//! [`Connector`](crate::Connector) themselves.

use serde::{Deserialize, Serialize};

use crate::error_codes::ErrorCode;
use crate::session::{Phase, PhaseSnapshot, Player, Prompt, Response, RoomSnapshot};

// ── Payload structs ─────────────────────────────────────────────────

/// Payload for the `room_joined` server message.
/// Boxed in `ServerMessage` to reduce enum size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinedPayload {
    pub room_id: String,
    pub player_id: String,
    pub player_name: String,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub connected_count: u32,
    #[serde(default)]
    pub total_count: u32,
    /// Phase of a round already in progress, when joining mid-game.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<PhaseSnapshot>,
}

/// Payload for the `room_state` server message.
/// Boxed in `ServerMessage` to reduce enum size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStatePayload {
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<PhaseSnapshot>,
}

impl From<RoomStatePayload> for RoomSnapshot {
    fn from(payload: RoomStatePayload) -> Self {
        Self {
            players: payload.players,
            connected_count: payload.connected_count,
            total_count: payload.total_count,
            phase: payload.game_state,
        }
    }
}

/// Payload for the `results_phase_started` server message.
/// Boxed in `ServerMessage` to reduce enum size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Response>>,
    /// Roster with updated scores.
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_duration: Option<u32>,
}

/// Payload for the `game_paused` server message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room, creating it if needed.
    JoinRoom { room_id: String, player_name: String },
    /// Leave the current room.
    LeaveRoom,
    /// Ask the server to begin the next round.
    StartRound,
    /// Submit a response to the current prompt.
    SubmitResponse { response: String },
    /// Guess which response is correct; the index refers to the server's list.
    SubmitGuess { guess_index: usize },
    /// Heartbeat to maintain connection.
    Ping,
}

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successfully joined a room (boxed to reduce enum size).
    RoomJoined(Box<RoomJoinedPayload>),
    /// Full room refresh (boxed to reduce enum size).
    RoomState(Box<RoomStatePayload>),
    /// A new round began; players may respond to the prompt.
    RoundStarted {
        round_number: u32,
        prompt: Prompt,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase_duration: Option<u32>,
    },
    /// All responses are in; players guess among them.
    GuessingPhaseStarted {
        responses: Vec<Response>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase_duration: Option<u32>,
    },
    /// Guessing closed; results are shown (boxed to reduce enum size).
    ResultsPhaseStarted(Box<ResultsPayload>),
    /// Seconds left in the current phase.
    CountdownUpdate { time_remaining: u32 },
    /// The round was paused, e.g. because too few players remain.
    ///
    /// Servers may send it without `data`; that decodes to `None`.
    GamePaused(Option<PauseInfo>),
    /// Another player joined the room.
    PlayerJoined { player: Player },
    /// Another player left the room.
    PlayerLeft { player_id: String },
    /// Pong response to ping.
    Pong,
    /// Error message, typically a rejected action.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
}

impl ServerMessage {
    /// The phase update this message implies, if any.
    pub fn phase_snapshot(&self) -> Option<PhaseSnapshot> {
        match self {
            Self::RoundStarted {
                round_number,
                prompt,
                phase_duration,
            } => {
                let mut snapshot = PhaseSnapshot::new(Phase::Responding)
                    .with_round_number(*round_number)
                    .with_prompt(prompt.clone());
                snapshot.phase_duration = *phase_duration;
                Some(snapshot)
            }
            Self::GuessingPhaseStarted {
                responses,
                phase_duration,
            } => {
                let mut snapshot =
                    PhaseSnapshot::new(Phase::Guessing).with_responses(responses.clone());
                snapshot.phase_duration = *phase_duration;
                Some(snapshot)
            }
            Self::ResultsPhaseStarted(payload) => {
                let mut snapshot = PhaseSnapshot::new(Phase::Results);
                snapshot.responses = payload.responses.clone();
                snapshot.phase_duration = payload.phase_duration;
                Some(snapshot)
            }
            Self::GamePaused(_) => Some(PhaseSnapshot::new(Phase::Waiting)),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn unit_messages_omit_data() {
        let json = serde_json::to_string(&ClientMessage::StartRound).unwrap();
        assert_eq!(json, r#"{"type":"start_round"}"#);
    }

    #[test]
    fn guess_uses_wire_field_names() {
        let json = serde_json::to_value(ClientMessage::SubmitGuess { guess_index: 2 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "submit_guess", "data": {"guess_index": 2}})
        );
    }

    #[test]
    fn round_started_implies_responding() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"round_started","data":{"round_number":4,"prompt":{"text":"A color"},"phase_duration":90}}"#,
        )
        .unwrap();
        let snapshot = msg.phase_snapshot().unwrap();
        assert_eq!(snapshot.phase, Phase::Responding);
        assert_eq!(snapshot.round_number, Some(4));
        assert_eq!(snapshot.phase_duration, Some(90));
    }

    #[test]
    fn bare_pause_implies_waiting() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"game_paused"}"#).unwrap();
        assert_eq!(msg, ServerMessage::GamePaused(None));
        assert_eq!(msg.phase_snapshot().unwrap().phase, Phase::Waiting);
    }

    #[test]
    fn pause_reason_is_optional_inside_data() {
        let empty: ServerMessage =
            serde_json::from_str(r#"{"type":"game_paused","data":{}}"#).unwrap();
        assert_eq!(empty, ServerMessage::GamePaused(Some(PauseInfo::default())));

        let null: ServerMessage =
            serde_json::from_str(r#"{"type":"game_paused","data":null}"#).unwrap();
        assert_eq!(null, ServerMessage::GamePaused(None));
    }

    #[test]
    fn countdown_has_no_phase() {
        let msg = ServerMessage::CountdownUpdate { time_remaining: 5 };
        assert!(msg.phase_snapshot().is_none());
    }
}
