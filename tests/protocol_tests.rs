#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Protocol serialization tests for the round client.
//!
//! Verifies the wire shape of every `ClientMessage`, decodes `ServerMessage`
//! fixtures that match real server output, and checks how optional and
//! unknown fields are handled.

use round_client::error_codes::ErrorCode;
use round_client::protocol::{ClientMessage, RoomStatePayload, ServerMessage};
use round_client::session::{Phase, Prompt, Response, RoomSnapshot};
use serde_json::json;

// ════════════════════════════════════════════════════════════════════
// Helper
// ════════════════════════════════════════════════════════════════════

fn decode(value: serde_json::Value) -> ServerMessage {
    serde_json::from_value(value).expect("deserialize")
}

fn encode(msg: &ClientMessage) -> serde_json::Value {
    serde_json::to_value(msg).expect("serialize")
}

// ════════════════════════════════════════════════════════════════════
// ClientMessage wire shapes
// ════════════════════════════════════════════════════════════════════

#[test]
fn client_message_join_room_shape() {
    let msg = ClientMessage::JoinRoom {
        room_id: "ROOM42".into(),
        player_name: "Alice".into(),
    };
    assert_eq!(
        encode(&msg),
        json!({"type": "join_room", "data": {"room_id": "ROOM42", "player_name": "Alice"}})
    );
}

#[test]
fn client_message_submit_response_shape() {
    let msg = ClientMessage::SubmitResponse {
        response: "blue".into(),
    };
    assert_eq!(
        encode(&msg),
        json!({"type": "submit_response", "data": {"response": "blue"}})
    );
}

#[test]
fn client_message_unit_variants_have_no_data() {
    for (msg, tag) in [
        (ClientMessage::LeaveRoom, "leave_room"),
        (ClientMessage::StartRound, "start_round"),
        (ClientMessage::Ping, "ping"),
    ] {
        let value = encode(&msg);
        assert_eq!(value["type"], tag);
        assert!(value.get("data").is_none(), "{tag} should omit data");
    }
}

#[test]
fn client_message_decodes_what_it_encodes_for_guesses() {
    let msg: ClientMessage =
        serde_json::from_str(r#"{"type":"submit_guess","data":{"guess_index":3}}"#).unwrap();
    assert_eq!(msg, ClientMessage::SubmitGuess { guess_index: 3 });
}

// ════════════════════════════════════════════════════════════════════
// Server JSON fixture tests (simulate real server JSON)
// ════════════════════════════════════════════════════════════════════

#[test]
fn fixture_room_joined_from_server() {
    let msg = decode(json!({
        "type": "room_joined",
        "data": {
            "room_id": "ROOM42",
            "player_id": "p-1",
            "player_name": "Alice",
            "players": [
                {"id": "p-1", "name": "Alice", "connected": true, "score": 0},
                {"id": "p-2", "name": "Bob", "connected": false, "score": 4}
            ],
            "connected_count": 1,
            "total_count": 2
        }
    }));
    let ServerMessage::RoomJoined(payload) = msg else {
        panic!("expected RoomJoined");
    };
    assert_eq!(payload.room_id, "ROOM42");
    assert_eq!(payload.players.len(), 2);
    assert!(!payload.players[1].connected);
    assert_eq!(payload.players[1].score, 4);
    assert!(payload.game_state.is_none());
}

#[test]
fn fixture_room_joined_mid_round() {
    let msg = decode(json!({
        "type": "room_joined",
        "data": {
            "room_id": "ROOM42",
            "player_id": "p-3",
            "player_name": "Carol",
            "game_state": {
                "phase": "guessing",
                "round_number": 2,
                "prompt": {"text": "Name a fruit", "id": "q-17"},
                "responses": ["apple", "pear"],
                "phase_duration": 30,
                "time_remaining": 12
            }
        }
    }));
    let ServerMessage::RoomJoined(payload) = msg else {
        panic!("expected RoomJoined");
    };
    assert!(payload.players.is_empty());
    assert_eq!(payload.connected_count, 0);

    let state = payload.game_state.unwrap();
    assert_eq!(state.phase, Phase::Guessing);
    assert_eq!(state.prompt.unwrap().id.as_deref(), Some("q-17"));
    assert_eq!(
        state.responses.unwrap(),
        vec![Response::new("apple"), Response::new("pear")]
    );
    assert_eq!(state.time_remaining, Some(12));
}

#[test]
fn fixture_room_state_converts_to_snapshot() {
    let msg = decode(json!({
        "type": "room_state",
        "data": {
            "players": [{"id": "p-1", "name": "Alice"}],
            "game_state": {"phase": "results"}
        }
    }));
    let ServerMessage::RoomState(payload) = msg else {
        panic!("expected RoomState");
    };
    let snapshot: RoomSnapshot = (*payload).into();
    assert_eq!(snapshot.players.len(), 1);
    assert!(snapshot.players[0].connected, "connected defaults to true");
    assert_eq!(snapshot.connected_count, None);
    assert_eq!(snapshot.phase.unwrap().phase, Phase::Results);
}

#[test]
fn fixture_round_started_from_server() {
    let msg = decode(json!({
        "type": "round_started",
        "data": {"round_number": 3, "prompt": {"text": "Name a color"}}
    }));
    let snapshot = msg.phase_snapshot().unwrap();
    assert_eq!(snapshot.phase, Phase::Responding);
    assert_eq!(snapshot.round_number, Some(3));
    assert_eq!(snapshot.prompt, Some(Prompt::new("Name a color")));
    assert_eq!(snapshot.phase_duration, None);
    assert_eq!(snapshot.responses, None);
}

#[test]
fn fixture_guessing_phase_started_from_server() {
    let msg = decode(json!({
        "type": "guessing_phase_started",
        "data": {"responses": ["red", "blue"], "phase_duration": 30}
    }));
    let snapshot = msg.phase_snapshot().unwrap();
    assert_eq!(snapshot.phase, Phase::Guessing);
    assert_eq!(snapshot.responses.unwrap().len(), 2);
    assert_eq!(snapshot.phase_duration, Some(30));
}

#[test]
fn fixture_results_phase_started_without_responses() {
    let msg = decode(json!({
        "type": "results_phase_started",
        "data": {"players": [{"id": "p-1", "name": "Alice", "score": 7}]}
    }));
    let snapshot = msg.phase_snapshot().unwrap();
    assert_eq!(snapshot.phase, Phase::Results);
    // Absent responses keep whatever the guessing phase showed.
    assert_eq!(snapshot.responses, None);

    let ServerMessage::ResultsPhaseStarted(payload) = msg else {
        panic!("expected ResultsPhaseStarted");
    };
    assert_eq!(payload.players[0].score, 7);
}

#[test]
fn fixture_countdown_update_from_server() {
    let msg = decode(json!({"type": "countdown_update", "data": {"time_remaining": 9}}));
    assert_eq!(msg, ServerMessage::CountdownUpdate { time_remaining: 9 });
    assert!(msg.phase_snapshot().is_none());
}

#[test]
fn fixture_game_paused_from_server() {
    let msg = decode(json!({"type": "game_paused", "data": {"reason": "not enough players"}}));
    assert_eq!(msg.phase_snapshot().unwrap().phase, Phase::Waiting);
    let ServerMessage::GamePaused(Some(info)) = msg else {
        panic!("expected GamePaused with data");
    };
    assert_eq!(info.reason.as_deref(), Some("not enough players"));
}

#[test]
fn fixture_game_paused_without_data() {
    let msg = decode(json!({"type": "game_paused"}));
    assert_eq!(msg, ServerMessage::GamePaused(None));
    assert_eq!(msg.phase_snapshot().unwrap().phase, Phase::Waiting);
}

#[test]
fn fixture_player_left_from_server() {
    let msg = decode(json!({"type": "player_left", "data": {"player_id": "p-2"}}));
    assert_eq!(
        msg,
        ServerMessage::PlayerLeft {
            player_id: "p-2".into()
        }
    );
}

#[test]
fn fixture_pong_from_server() {
    let msg: ServerMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
    assert_eq!(msg, ServerMessage::Pong);
}

#[test]
fn fixture_error_from_server() {
    let msg = decode(json!({
        "type": "error",
        "data": {"message": "You already guessed", "error_code": "ALREADY_SUBMITTED"}
    }));
    let ServerMessage::Error {
        message,
        error_code,
    } = msg
    else {
        panic!("expected Error");
    };
    assert_eq!(message, "You already guessed");
    assert_eq!(error_code, Some(ErrorCode::AlreadySubmitted));
}

#[test]
fn fixture_error_with_unknown_code() {
    let msg = decode(json!({
        "type": "error",
        "data": {"message": "??", "error_code": "BRAND_NEW_CODE"}
    }));
    assert!(matches!(
        msg,
        ServerMessage::Error {
            error_code: Some(ErrorCode::Unknown),
            ..
        }
    ));
}

#[test]
fn fixture_error_without_code() {
    let msg = decode(json!({"type": "error", "data": {"message": "boom"}}));
    assert!(matches!(
        msg,
        ServerMessage::Error {
            error_code: None,
            ..
        }
    ));
}

// ════════════════════════════════════════════════════════════════════
// Rejected input
// ════════════════════════════════════════════════════════════════════

#[test]
fn unknown_message_type_is_rejected() {
    let result = serde_json::from_str::<ServerMessage>(r#"{"type":"teleport","data":{}}"#);
    assert!(result.is_err());
}

#[test]
fn unknown_phase_is_rejected() {
    let result = serde_json::from_value::<RoomStatePayload>(json!({
        "game_state": {"phase": "intermission"}
    }));
    assert!(result.is_err());
}

#[test]
fn missing_required_field_is_rejected() {
    let result = serde_json::from_value::<ServerMessage>(json!({
        "type": "round_started",
        "data": {"round_number": 1}
    }));
    assert!(result.is_err());
}

// ════════════════════════════════════════════════════════════════════
// ErrorCode serialization (SCREAMING_SNAKE_CASE)
// ════════════════════════════════════════════════════════════════════

#[test]
fn error_code_wire_names() {
    let cases = [
        (ErrorCode::RoomNotFound, "ROOM_NOT_FOUND"),
        (ErrorCode::NotEnoughPlayers, "NOT_ENOUGH_PLAYERS"),
        (ErrorCode::InvalidPhase, "INVALID_PHASE"),
        (ErrorCode::RateLimitExceeded, "RATE_LIMIT_EXCEEDED"),
    ];
    for (code, wire) in cases {
        assert_eq!(serde_json::to_value(&code).unwrap(), json!(wire));
    }
}

#[test]
fn error_code_descriptions_are_not_empty() {
    for code in [
        ErrorCode::InvalidInput,
        ErrorCode::RoomFull,
        ErrorCode::CannotGuessOwnResponse,
        ErrorCode::ServiceUnavailable,
        ErrorCode::Unknown,
    ] {
        assert!(!code.description().is_empty());
        assert_eq!(code.to_string(), code.description());
    }
}
