//! End-to-end client tests.
//!
//! Uses the shared `MockConnector` and `MockTransport` from `tests/common` to
//! script server frames and verify that `RoundClient` turns them into session
//! state, turns intents into protocol messages, and recovers lost connections.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use round_client::error_codes::ErrorCode;
use round_client::event::{ConnectionStatus, UserAction};
use round_client::identity::{IdentityStore, MemoryIdentityStore, StoredIdentity};
use round_client::session::Response;
use round_client::{names, ClientConfig, ClientMessage, EventData, Phase, RoundClient};

use common::{
    countdown_json, error_json, game_paused_json, guessing_json, player, player_joined_json,
    player_left_json, pong_json, results_json, room_joined_json, round_started_json, wait_until,
    ConnectPlan, EventLog, MockConnector, MockTransport, ServerHandle,
};

const WAIT: Duration = Duration::from_secs(5);

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn start(
    connector: Arc<MockConnector>,
    config: ClientConfig,
) -> (RoundClient, Arc<MemoryIdentityStore>) {
    let identity = Arc::new(MemoryIdentityStore::new());
    let client = RoundClient::start(config, connector, identity.clone()).unwrap();
    (client, identity)
}

async fn wait_for_sent(server: &ServerHandle, expected: &ClientMessage) {
    wait_until(WAIT, || server.sent().contains(expected)).await;
}

/// Connect, join `R1` as Alice (p1) alongside Bob (p2).
async fn joined_client() -> (RoundClient, ServerHandle, EventLog) {
    let (connector, server) = MockConnector::single();
    let (client, _identity) = start(connector, ClientConfig::new());
    let log = EventLog::attach(
        client.events(),
        &[
            names::PHASE_CHANGED,
            names::USER_ACTION,
            names::SYSTEM_ERROR,
            names::TIMER_UPDATE,
            names::TIMER_EXPIRED,
            names::ROOM_JOINED,
            names::GAME_PAUSED,
        ],
    );

    client.join_room("R1", "Alice");
    wait_for_sent(
        &server,
        &ClientMessage::JoinRoom {
            room_id: "R1".into(),
            player_name: "Alice".into(),
        },
    )
    .await;
    server.push(room_joined_json("R1", "p1", "Alice", &[player("p2", "Bob")]));
    wait_until(WAIT, || client.session().room_info().in_room()).await;
    (client, server, log)
}

// ════════════════════════════════════════════════════════════════════
// Joining
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_is_sent_once_connected_and_saves_identity() {
    let (connector, server) = MockConnector::single();
    let (mut client, identity) = start(connector, ClientConfig::new());
    let log = EventLog::attach(client.events(), &[names::ROOM_JOINED]);

    client.join_room("R1", "Alice");
    wait_for_sent(
        &server,
        &ClientMessage::JoinRoom {
            room_id: "R1".into(),
            player_name: "Alice".into(),
        },
    )
    .await;

    server.push(room_joined_json("R1", "p1", "Alice", &[player("p2", "Bob")]));
    wait_until(WAIT, || log.count(names::ROOM_JOINED) == 1).await;

    let room = client.session().room_info();
    assert_eq!(room.room_id.as_deref(), Some("R1"));
    assert_eq!(room.player_id.as_deref(), Some("p1"));
    assert_eq!(room.connected_count, 2);
    assert_eq!(
        identity.load().unwrap(),
        Some(StoredIdentity {
            room_id: "R1".into(),
            player_id: "p1".into(),
            player_name: "Alice".into(),
        })
    );

    client.shutdown().await;
}

#[tokio::test]
async fn stored_identity_is_rejoined_on_startup() {
    let (connector, server) = MockConnector::single();
    let identity = Arc::new(MemoryIdentityStore::with_identity(StoredIdentity {
        room_id: "R9".into(),
        player_id: "p7".into(),
        player_name: "Carol".into(),
    }));
    let mut client = RoundClient::start(ClientConfig::new(), connector, identity).unwrap();

    wait_for_sent(
        &server,
        &ClientMessage::JoinRoom {
            room_id: "R9".into(),
            player_name: "Carol".into(),
        },
    )
    .await;

    client.shutdown().await;
}

#[tokio::test]
async fn stored_identity_is_ignored_without_auto_rejoin() {
    let (connector, server) = MockConnector::single();
    let identity = Arc::new(MemoryIdentityStore::with_identity(StoredIdentity {
        room_id: "R9".into(),
        player_id: "p7".into(),
        player_name: "Carol".into(),
    }));
    let mut client = RoundClient::start(
        ClientConfig::new().with_auto_rejoin(false),
        connector,
        identity,
    )
    .unwrap();

    wait_until(WAIT, || client.is_connected()).await;
    server.push(pong_json());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.sent_without_pings().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn leave_room_sends_leave_and_forgets_identity() {
    let (connector, server) = MockConnector::single();
    let (mut client, identity) = start(connector, ClientConfig::new());
    let log = EventLog::attach(client.events(), &[names::ROOM_LEFT]);

    client.join_room("R1", "Alice");
    server.push(room_joined_json("R1", "p1", "Alice", &[]));
    wait_until(WAIT, || identity.load().unwrap().is_some()).await;

    client.leave_room();
    wait_for_sent(&server, &ClientMessage::LeaveRoom).await;

    assert!(identity.load().unwrap().is_none());
    assert!(!client.session().room_info().in_room());
    assert_eq!(log.count(names::ROOM_LEFT), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn roster_changes_update_counts() {
    let (mut client, server, _log) = joined_client().await;

    server.push(player_joined_json("p3", "Dave"));
    wait_until(WAIT, || client.session().room_info().connected_count == 3).await;

    server.push(player_left_json("p2"));
    wait_until(WAIT, || client.session().room_info().connected_count == 2).await;
    let roster: Vec<String> = client
        .session()
        .snapshot()
        .players
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(roster, vec!["Alice", "Dave"]);

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Round flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_round_flow() {
    let (mut client, server, log) = joined_client().await;

    client.start_round();
    wait_for_sent(&server, &ClientMessage::StartRound).await;

    server.push(round_started_json(1, "Name a color", 60));
    wait_until(WAIT, || client.session().phase() == Phase::Responding).await;
    let state = client.session().snapshot();
    assert_eq!(state.round_number, 1);
    assert_eq!(state.prompt.unwrap().text, "Name a color");
    assert_eq!(state.time_remaining, Some(60));

    client.submit_response("  blue ");
    wait_for_sent(
        &server,
        &ClientMessage::SubmitResponse {
            response: "blue".into(),
        },
    )
    .await;

    server.push(guessing_json(&["red", "blue", "green"], 30));
    wait_until(WAIT, || client.session().phase() == Phase::Guessing).await;

    let visible = client.session().visible_responses();
    assert_eq!(
        visible,
        vec![(Response::new("red"), 0), (Response::new("green"), 2)]
    );

    client.submit_guess(2);
    wait_for_sent(&server, &ClientMessage::SubmitGuess { guess_index: 2 }).await;

    let mut alice = player("p1", "Alice");
    alice.score = 3;
    server.push(results_json(vec![alice, player("p2", "Bob")]));
    wait_until(WAIT, || client.session().phase() == Phase::Results).await;

    let state = client.session().snapshot();
    assert_eq!(state.players[0].score, 3);
    assert_eq!(state.responses.len(), 3);

    let phases: Vec<(Phase, Phase)> = log
        .named(names::PHASE_CHANGED)
        .into_iter()
        .map(|event| match event.data {
            EventData::PhaseChanged { old, new } => (old, new),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            (Phase::Waiting, Phase::Responding),
            (Phase::Responding, Phase::Guessing),
            (Phase::Guessing, Phase::Results),
        ]
    );

    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_submissions_send_once() {
    let (mut client, server, log) = joined_client().await;
    server.push(round_started_json(1, "Name a color", 60));
    wait_until(WAIT, || client.session().phase() == Phase::Responding).await;

    client.submit_response("blue");
    client.submit_response("blue");
    client.submit_response("red");
    wait_for_sent(
        &server,
        &ClientMessage::SubmitResponse {
            response: "blue".into(),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let submissions = server
        .sent()
        .into_iter()
        .filter(|msg| matches!(msg, ClientMessage::SubmitResponse { .. }))
        .count();
    assert_eq!(submissions, 1);
    assert_eq!(log.count(names::USER_ACTION), 1);
    assert_eq!(log.count(names::SYSTEM_ERROR), 2);

    let action = &log.named(names::USER_ACTION)[0];
    assert!(matches!(
        &action.data,
        EventData::UserAction(UserAction::ResponseSubmitted { text }) if text == "blue"
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn start_round_needs_two_connected_players() {
    let (connector, server) = MockConnector::single();
    let (mut client, _identity) = start(connector, ClientConfig::new());
    let log = EventLog::attach(client.events(), &[names::SYSTEM_ERROR]);

    client.join_room("R1", "Alice");
    server.push(room_joined_json("R1", "p1", "Alice", &[]));
    wait_until(WAIT, || client.session().room_info().in_room()).await;

    client.start_round();
    assert_eq!(log.count(names::SYSTEM_ERROR), 1);
    assert!(!server.sent().contains(&ClientMessage::StartRound));

    client.shutdown().await;
}

#[tokio::test]
async fn out_of_range_guess_is_rejected_locally() {
    let (mut client, server, log) = joined_client().await;
    server.push(guessing_json(&["red", "blue"], 30));
    wait_until(WAIT, || client.session().phase() == Phase::Guessing).await;

    client.submit_guess(5);

    assert_eq!(log.count(names::SYSTEM_ERROR), 1);
    assert!(!client.session().guards().has_submitted_guess);

    client.shutdown().await;
}

#[tokio::test]
async fn retryable_server_rejection_allows_resubmission() {
    let (mut client, server, log) = joined_client().await;
    server.push(guessing_json(&["red", "blue"], 30));
    wait_until(WAIT, || client.session().phase() == Phase::Guessing).await;

    client.submit_guess(0);
    wait_for_sent(&server, &ClientMessage::SubmitGuess { guess_index: 0 }).await;

    server.push(error_json(
        "cannot guess your own response",
        Some(ErrorCode::CannotGuessOwnResponse),
    ));
    wait_until(WAIT, || !client.session().guards().has_submitted_guess).await;

    let error = &log.named(names::SYSTEM_ERROR)[0];
    match &error.data {
        EventData::Error(report) => {
            assert_eq!(report.error_code, Some(ErrorCode::CannotGuessOwnResponse));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    client.submit_guess(1);
    wait_for_sent(&server, &ClientMessage::SubmitGuess { guess_index: 1 }).await;

    client.shutdown().await;
}

#[tokio::test]
async fn countdown_publishes_timer_events() {
    let (mut client, server, log) = joined_client().await;
    server.push(round_started_json(1, "Name a color", 3));
    for remaining in [2, 1, 0, 0] {
        server.push(countdown_json(remaining));
    }

    wait_until(WAIT, || log.count(names::TIMER_UPDATE) == 4).await;
    assert_eq!(log.count(names::TIMER_EXPIRED), 1);
    assert_eq!(client.session().snapshot().time_remaining, Some(0));

    client.shutdown().await;
}

#[tokio::test]
async fn pause_returns_to_waiting() {
    let (mut client, server, log) = joined_client().await;
    server.push(round_started_json(1, "Name a color", 60));
    wait_until(WAIT, || client.session().phase() == Phase::Responding).await;

    server.push(game_paused_json("not enough players"));
    wait_until(WAIT, || log.count(names::GAME_PAUSED) == 1).await;

    let state = client.session().snapshot();
    assert_eq!(state.phase, Phase::Waiting);
    assert!(state.prompt.is_none());
    let paused = log.named(names::GAME_PAUSED);
    let EventData::Paused(info) = &paused[0].data else {
        panic!("expected a pause payload, got {:?}", paused[0].data);
    };
    assert_eq!(info.reason.as_deref(), Some("not enough players"));

    client.shutdown().await;
}

#[tokio::test]
async fn bare_pause_frame_returns_to_waiting() {
    let (mut client, server, log) = joined_client().await;
    server.push(round_started_json(1, "Name a color", 60));
    wait_until(WAIT, || client.session().phase() == Phase::Responding).await;

    server.push(r#"{"type":"game_paused"}"#.to_string());
    wait_until(WAIT, || log.count(names::GAME_PAUSED) == 1).await;

    assert_eq!(client.session().phase(), Phase::Waiting);
    let paused = log.named(names::GAME_PAUSED);
    assert!(matches!(&paused[0].data, EventData::Paused(info) if info.reason.is_none()));

    client.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let (mut client, server, _log) = joined_client().await;

    server.push("not json".into());
    server.push(r#"{"type":"mystery","data":{}}"#.into());
    server.push(round_started_json(2, "Still alive", 60));

    wait_until(WAIT, || client.session().phase() == Phase::Responding).await;
    assert!(client.is_connected());

    client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_room() {
    let (first, first_server) = MockTransport::pair();
    let (second, second_server) = MockTransport::pair();
    let connector = MockConnector::new(vec![
        ConnectPlan::Accept(first),
        ConnectPlan::Accept(second),
    ]);
    let (mut client, _identity) = start(Arc::clone(&connector), ClientConfig::new());
    let log = EventLog::attach(
        client.events(),
        &[
            names::CONNECTION_CONNECTED,
            names::CONNECTION_DISCONNECTED,
            names::CONNECTION_RECONNECTING,
        ],
    );

    client.join_room("R1", "Alice");
    first_server.push(room_joined_json("R1", "p1", "Alice", &[player("p2", "Bob")]));
    first_server.push(round_started_json(1, "Name a color", 60));
    wait_until(WAIT, || client.session().phase() == Phase::Responding).await;

    first_server.disconnect();
    let join = ClientMessage::JoinRoom {
        room_id: "R1".into(),
        player_name: "Alice".into(),
    };
    wait_until(Duration::from_secs(3), || second_server.sent().contains(&join)).await;

    assert_eq!(connector.attempts(), 2);
    assert_eq!(
        log.names(),
        vec![
            names::CONNECTION_CONNECTED,
            names::CONNECTION_DISCONNECTED,
            names::CONNECTION_RECONNECTING,
            names::CONNECTION_CONNECTED,
        ]
    );
    match &log.named(names::CONNECTION_RECONNECTING)[0].data {
        EventData::Connection(ConnectionStatus::Reconnecting { attempt, delay }) => {
            assert_eq!(*attempt, 1);
            assert_eq!(*delay, Duration::from_secs(1));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    match &log.named(names::CONNECTION_CONNECTED)[1].data {
        EventData::Connection(ConnectionStatus::Connected { attempt }) => assert_eq!(*attempt, 1),
        other => panic!("unexpected payload {other:?}"),
    }
    // The disconnect dropped the session back to waiting until the server
    // says otherwise.
    assert_eq!(client.session().phase(), Phase::Waiting);
    assert_eq!(client.reliability().recovery_attempt(), 0);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_attempts_run_out() {
    let connector = MockConnector::new(vec![]);
    let config = ClientConfig::new().with_max_reconnect_attempts(3);
    let (mut client, _identity) = start(Arc::clone(&connector), config);
    let log = EventLog::attach(
        client.events(),
        &[
            names::CONNECTION_ERROR,
            names::CONNECTION_RECONNECTING,
            names::CONNECTION_FAILED,
        ],
    );

    wait_until(Duration::from_secs(60), || {
        log.count(names::CONNECTION_FAILED) == 1
    })
    .await;

    let delays: Vec<Duration> = log
        .named(names::CONNECTION_RECONNECTING)
        .into_iter()
        .map(|event| match event.data {
            EventData::Connection(ConnectionStatus::Reconnecting { delay, .. }) => delay,
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(log.count(names::CONNECTION_ERROR), 4);
    assert_eq!(connector.attempts(), 4);
    match &log.named(names::CONNECTION_FAILED)[0].data {
        EventData::Connection(ConnectionStatus::Failed { attempts }) => assert_eq!(*attempts, 3),
        other => panic!("unexpected payload {other:?}"),
    }

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_schedules_one_recovery() {
    let (transport, _server) = MockTransport::pair();
    let connector = MockConnector::new(vec![ConnectPlan::Hang, ConnectPlan::Accept(transport)]);
    let config = ClientConfig::new().with_connect_timeout(Duration::from_secs(2));
    let (mut client, _identity) = start(Arc::clone(&connector), config);
    let log = EventLog::attach(
        client.events(),
        &[names::CONNECTION_ERROR, names::CONNECTION_RECONNECTING],
    );

    wait_until(Duration::from_secs(10), || client.is_connected()).await;

    assert_eq!(connector.attempts(), 2);
    assert_eq!(log.count(names::CONNECTION_ERROR), 1);
    assert_eq!(log.count(names::CONNECTION_RECONNECTING), 1);
    assert!(!client.reliability().is_timeout_pending());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_while_connected() {
    let (connector, server) = MockConnector::single();
    let config = ClientConfig::new().with_heartbeat_interval(Duration::from_secs(5));
    let (mut client, _identity) = start(connector, config);
    wait_until(WAIT, || client.is_connected()).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    let pings = server
        .sent()
        .into_iter()
        .filter(|msg| *msg == ClientMessage::Ping)
        .count();
    assert_eq!(pings, 2);

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_transport_and_reports_disconnect() {
    let (connector, server) = MockConnector::single();
    let (mut client, _identity) = start(connector, ClientConfig::new());
    let log = EventLog::attach(client.events(), &[names::CONNECTION_DISCONNECTED]);
    wait_until(WAIT, || client.is_connected()).await;

    client.shutdown().await;

    assert!(server.is_closed());
    assert!(!client.is_connected());
    match &log.named(names::CONNECTION_DISCONNECTED)[0].data {
        EventData::Connection(ConnectionStatus::Disconnected { reason }) => {
            assert_eq!(reason.as_deref(), Some("client shut down"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn intents_are_ignored_after_shutdown() {
    let (connector, server) = MockConnector::single();
    let (mut client, _identity) = start(connector, ClientConfig::new());
    wait_until(WAIT, || client.is_connected()).await;
    client.shutdown().await;

    client.join_room("R1", "Alice");
    assert!(server.sent().is_empty());
}
