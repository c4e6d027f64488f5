//! Glue between user intents, the session state machine and the transport.
//!
//! The [`Coordinator`] subscribes to the `user:*` intents on the shared
//! [`EventDispatcher`], checks them against the [`SessionStateMachine`] guards
//! and forwards the accepted ones to a background connection loop. The loop
//! owns the [`Transport`], translates server frames into state machine calls
//! and reconnects with exponential backoff when the connection drops.
//!
//! Outgoing messages travel over an unbounded MPSC channel, the same shape as
//! a client handle talking to its transport task. Commands accepted while
//! connected but still queued when the connection drops are discarded, never
//! replayed on the next connection.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ClientConfig;
use crate::dispatcher::{EventDispatcher, SubscribeOptions, Subscription};
use crate::error::{ClientError, HandlerError, Result};
use crate::event::{names, ConnectionStatus, ErrorReport, Event, EventData, UserIntent};
use crate::identity::{IdentityService, IdentityStore, StoredIdentity};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{Dependencies, RegistryError, Service, ServiceRegistry};
use crate::reliability::{BackoffPolicy, ConnectionReliability};
use crate::session::{GuardViolation, RoomInfo, RoomSnapshot, SessionStateMachine};
use crate::transport::{Connector, ConnectorService, Transport};

const SOURCE: &str = "coordinator";

/// Registry names of the services the coordinator depends on.
pub mod services {
    pub const EVENTS: &str = "events";
    pub const SESSION: &str = "session";
    pub const RELIABILITY: &str = "reliability";
    pub const CONFIG: &str = "config";
    pub const CONNECTOR: &str = "connector";
    pub const IDENTITY: &str = "identity";
    pub const COORDINATOR: &str = "coordinator";

    /// Everything [`COORDINATOR`] is built from, in resolution order.
    pub const COORDINATOR_DEPENDENCIES: [&str; 6] =
        [EVENTS, SESSION, RELIABILITY, CONFIG, CONNECTOR, IDENTITY];
}

const INTENT_EVENTS: [&str; 5] = [
    names::USER_ROOM_JOIN,
    names::USER_ROOM_LEAVE,
    names::USER_ROUND_START,
    names::USER_RESPONSE_SUBMITTED,
    names::USER_GUESS_SUBMITTED,
];

/// The room the coordinator (re)joins whenever a connection comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinTarget {
    room_id: String,
    player_name: String,
}

impl From<StoredIdentity> for JoinTarget {
    fn from(identity: StoredIdentity) -> Self {
        Self {
            room_id: identity.room_id,
            player_name: identity.player_name,
        }
    }
}

/// How a single connection attempt ended.
enum ConnectOutcome {
    Connected(Box<dyn Transport>),
    Failed(String),
    Shutdown,
}

/// How a live connection ended.
enum SessionEnd {
    Lost(Option<String>),
    Shutdown,
}

/// Wires user intents, server frames and connection recovery together.
pub struct Coordinator {
    events: Arc<EventDispatcher>,
    session: Arc<SessionStateMachine>,
    reliability: Arc<ConnectionReliability>,
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    identity: Arc<dyn IdentityStore>,
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
    join_target: Mutex<Option<JoinTarget>>,
    subscriptions: Mutex<Vec<Subscription>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        events: Arc<EventDispatcher>,
        session: Arc<SessionStateMachine>,
        reliability: Arc<ConnectionReliability>,
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityStore>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            events,
            session,
            reliability,
            config,
            connector,
            identity,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            join_target: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Build from resolved dependencies named as in [`services`].
    pub fn from_dependencies(deps: &Dependencies) -> std::result::Result<Self, RegistryError> {
        Ok(Self::new(
            deps.get(services::EVENTS)?,
            deps.get(services::SESSION)?,
            deps.get(services::RELIABILITY)?,
            deps.get(services::CONFIG)?,
            deps.get::<ConnectorService>(services::CONNECTOR)?.0.clone(),
            deps.get::<IdentityService>(services::IDENTITY)?.0.clone(),
        ))
    }

    /// Resolve every dependency from `registry` and build a coordinator.
    pub fn from_registry(registry: &ServiceRegistry) -> std::result::Result<Self, RegistryError> {
        Ok(Self::new(
            registry.get(services::EVENTS)?,
            registry.get(services::SESSION)?,
            registry.get(services::RELIABILITY)?,
            registry.get(services::CONFIG)?,
            registry.get::<ConnectorService>(services::CONNECTOR)?.0.clone(),
            registry.get::<IdentityService>(services::IDENTITY)?.0.clone(),
        ))
    }

    /// Subscribe to user intents and spawn the connection loop.
    ///
    /// Must be called from within a Tokio runtime. Calling it again after
    /// the first successful start is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            warn!("coordinator: already started");
            return;
        };

        if self.config.auto_rejoin {
            match self.identity.load() {
                Ok(Some(identity)) => {
                    info!(room_id = %identity.room_id, "coordinator: restoring stored identity");
                    *self.join_target.lock() = Some(identity.into());
                }
                Ok(None) => {}
                Err(e) => warn!("coordinator: failed to load stored identity: {e}"),
            }
        }

        let mut subscriptions = Vec::with_capacity(INTENT_EVENTS.len());
        for event in INTENT_EVENTS {
            let weak = Arc::downgrade(self);
            subscriptions.push(self.events.subscribe_with(
                event,
                SubscribeOptions::default().with_context(SOURCE),
                move |event: &Event| Self::on_intent(&weak, event),
            ));
        }
        *self.subscriptions.lock() = subscriptions;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        let task = tokio::spawn(Arc::clone(self).connection_loop(cmd_rx, shutdown_rx));
        *self.task.lock() = Some(task);
        debug!("coordinator: started");
    }

    /// Stop the connection loop, waiting up to `timeout` for a graceful close.
    pub async fn shutdown(&self, timeout: Duration) {
        debug!("coordinator: shutdown requested");
        self.unsubscribe_all();

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection loop aborted: {join_err}");
                    }
                }
            }
        }

        self.reliability.stop_all();
        self.reliability.mark_disconnected();
    }

    /// Abort the connection loop without a graceful close.
    pub fn abort(&self) {
        self.unsubscribe_all();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.reliability.stop_all();
        self.reliability.mark_disconnected();
    }

    pub fn is_connected(&self) -> bool {
        self.reliability.is_connected()
    }

    /// Returns `true` while the connection loop task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn unsubscribe_all(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }

    // ── Intents ─────────────────────────────────────────────────────

    fn on_intent(weak: &Weak<Self>, event: &Event) -> std::result::Result<(), HandlerError> {
        let Some(this) = weak.upgrade() else {
            return Ok(());
        };
        let Some(intent) = event.intent() else {
            return Err(format!("`{}` carried no user intent", event.name).into());
        };
        this.handle_intent(intent.clone());
        Ok(())
    }

    /// Validate `intent` and send the matching message, or report why not.
    pub fn handle_intent(&self, intent: UserIntent) {
        match intent {
            UserIntent::JoinRoom {
                room_id,
                player_name,
            } => self.join_room(room_id, player_name),
            UserIntent::LeaveRoom => self.leave_room(),
            UserIntent::StartRound => {
                if let Err(violation) = self.session.check_start_round() {
                    self.reject(violation);
                    return;
                }
                if let Err(e) = self.send(ClientMessage::StartRound) {
                    self.report(&e);
                }
            }
            UserIntent::SubmitResponse { text } => self.submit_response(text),
            UserIntent::SubmitGuess { index } => self.submit_guess(index),
        }
    }

    fn join_room(&self, room_id: String, player_name: String) {
        let mut target = self.join_target.lock();
        *target = Some(JoinTarget {
            room_id: room_id.clone(),
            player_name: player_name.clone(),
        });
        if !self.reliability.is_connected() {
            debug!(%room_id, "coordinator: join deferred until connected");
            return;
        }
        if let Err(e) = self.cmd_tx.send(ClientMessage::JoinRoom {
            room_id,
            player_name,
        }) {
            drop(target);
            self.report(&ClientError::TransportSend(e.to_string()));
        }
    }

    fn leave_room(&self) {
        *self.join_target.lock() = None;
        if let Err(e) = self.identity.clear() {
            warn!("coordinator: failed to clear stored identity: {e}");
        }
        if self.session.room_info().in_room() && self.reliability.is_connected() {
            if let Err(e) = self.cmd_tx.send(ClientMessage::LeaveRoom) {
                self.report(&ClientError::TransportSend(e.to_string()));
            }
        }
        self.session.reset();
        self.events
            .publish_from(names::ROOM_LEFT, EventData::None, SOURCE);
    }

    fn submit_response(&self, text: String) {
        let text = text.trim().to_owned();
        if text.is_empty() {
            self.reject(GuardViolation::EmptyResponse);
            return;
        }
        if let Err(violation) = self.session.check_submit_response() {
            self.reject(violation);
            return;
        }
        if !self.reliability.is_connected() {
            self.report(&ClientError::NotConnected);
            return;
        }
        if !self.session.mark_response_submitted(text.clone()) {
            self.reject(GuardViolation::AlreadySubmitted("response"));
            return;
        }
        if let Err(e) = self.send(ClientMessage::SubmitResponse { response: text }) {
            self.session.reset_submission_flags();
            self.report(&e);
        }
    }

    fn submit_guess(&self, index: usize) {
        if let Err(violation) = self.session.check_submit_guess(index) {
            self.reject(violation);
            return;
        }
        if !self.reliability.is_connected() {
            self.report(&ClientError::NotConnected);
            return;
        }
        if !self.session.mark_guess_submitted(index) {
            self.reject(GuardViolation::AlreadySubmitted("guess"));
            return;
        }
        if let Err(e) = self.send(ClientMessage::SubmitGuess { guess_index: index }) {
            self.session.reset_submission_flags();
            self.report(&e);
        }
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        if !self.reliability.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.cmd_tx
            .send(message)
            .map_err(|e| ClientError::TransportSend(e.to_string()))
    }

    fn reject(&self, violation: GuardViolation) {
        debug!(%violation, "coordinator: intent rejected");
        self.events.publish_from(
            names::SYSTEM_ERROR,
            EventData::Error(ErrorReport::new(violation.to_string())),
            SOURCE,
        );
    }

    fn report(&self, error: &ClientError) {
        warn!("coordinator: {error}");
        self.events.publish_from(
            names::SYSTEM_ERROR,
            EventData::Error(ErrorReport::new(error.to_string())),
            SOURCE,
        );
    }

    fn publish_connection(&self, name: &str, status: ConnectionStatus) {
        self.events
            .publish_from(name, EventData::Connection(status), SOURCE);
    }

    // ── Connection loop ─────────────────────────────────────────────

    async fn connection_loop(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("connection loop started");
        let policy = self.config.backoff();

        loop {
            let attempt = self.reliability.recovery_attempt();
            match self.connect(&mut shutdown_rx).await {
                ConnectOutcome::Shutdown => break,
                ConnectOutcome::Failed(reason) => {
                    warn!(attempt, "connection attempt failed: {reason}");
                    self.publish_connection(
                        names::CONNECTION_ERROR,
                        ConnectionStatus::Error { reason },
                    );
                }
                ConnectOutcome::Connected(mut transport) => {
                    self.on_connected(attempt);
                    let end = self
                        .run_session(transport.as_mut(), &mut cmd_rx, &mut shutdown_rx)
                        .await;
                    match end {
                        SessionEnd::Shutdown => {
                            self.on_disconnected(&mut cmd_rx, Some("client shut down".into()));
                            break;
                        }
                        SessionEnd::Lost(reason) => self.on_disconnected(&mut cmd_rx, reason),
                    }
                }
            }

            if !self.schedule_recovery(&policy, &mut shutdown_rx).await {
                break;
            }
        }

        self.reliability.stop_all();
        debug!("connection loop exited");
    }

    /// One connection attempt, bounded by the configured connect timeout.
    async fn connect(&self, shutdown_rx: &mut oneshot::Receiver<()>) -> ConnectOutcome {
        let (timeout_tx, timeout_rx) = oneshot::channel::<()>();
        self.reliability
            .start_connection_timeout(self.config.connect_timeout, move || {
                let _ = timeout_tx.send(());
            });

        let outcome = tokio::select! {
            result = self.connector.connect() => match result {
                Ok(transport) => ConnectOutcome::Connected(transport),
                Err(e) => ConnectOutcome::Failed(e.to_string()),
            },
            _ = timeout_rx => ConnectOutcome::Failed(ClientError::Timeout.to_string()),
            _ = shutdown_rx => ConnectOutcome::Shutdown,
        };

        self.reliability.clear_connection_timeout();
        outcome
    }

    fn on_connected(&self, attempt: u32) {
        // Holding the target lock keeps a concurrent join intent from sending
        // a second JoinRoom for the same connection.
        let target = self.join_target.lock();
        self.reliability.mark_connected();
        info!(attempt, "connected");

        let reliability = Arc::downgrade(&self.reliability);
        let cmd_tx = self.cmd_tx.clone();
        self.reliability.start_heartbeat(
            self.config.heartbeat_interval,
            move || reliability.upgrade().is_some_and(|r| r.is_connected()),
            move || {
                let _ = cmd_tx.send(ClientMessage::Ping);
            },
        );

        if let Some(target) = target.clone() {
            info!(room_id = %target.room_id, "rejoining room");
            let _ = self.cmd_tx.send(ClientMessage::JoinRoom {
                room_id: target.room_id,
                player_name: target.player_name,
            });
        }
        drop(target);

        self.publish_connection(
            names::CONNECTION_CONNECTED,
            ConnectionStatus::Connected { attempt },
        );
    }

    async fn run_session(
        &self,
        transport: &mut dyn Transport,
        cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                // Branch 1: outgoing message accepted from an intent or the heartbeat
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(msg) => {
                            debug!("sending client message: {:?}", std::mem::discriminant(&msg));
                            match serde_json::to_string(&msg) {
                                Ok(json) => {
                                    if let Err(e) = transport.send(json).await {
                                        error!("transport send error: {e}");
                                        return SessionEnd::Lost(Some(format!("transport send error: {e}")));
                                    }
                                }
                                Err(e) => {
                                    error!("failed to serialize ClientMessage: {e}");
                                }
                            }
                        }
                        None => {
                            debug!("command channel closed, shutting down connection loop");
                            let _ = transport.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }

                // Branch 2: shutdown signal
                _ = &mut *shutdown_rx => {
                    debug!("shutdown signal received");
                    let _ = transport.close().await;
                    return SessionEnd::Shutdown;
                }

                // Branch 3: incoming frame from the server
                incoming = transport.recv() => {
                    match incoming {
                        Some(Ok(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(server_msg) => self.handle_server_message(server_msg),
                            Err(e) => {
                                warn!("failed to deserialize server message: {e}; raw: {text}");
                            }
                        },
                        Some(Err(e)) => {
                            error!("transport receive error: {e}");
                            return SessionEnd::Lost(Some(format!("transport receive error: {e}")));
                        }
                        None => {
                            debug!("transport closed by server");
                            return SessionEnd::Lost(None);
                        }
                    }
                }
            }
        }
    }

    fn on_disconnected(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
        reason: Option<String>,
    ) {
        self.reliability.mark_disconnected();

        let mut dropped_submission = false;
        while let Ok(msg) = cmd_rx.try_recv() {
            debug!(
                "discarding queued message: {:?}",
                std::mem::discriminant(&msg)
            );
            dropped_submission |= matches!(
                msg,
                ClientMessage::SubmitResponse { .. } | ClientMessage::SubmitGuess { .. }
            );
        }
        if dropped_submission {
            self.session.reset_submission_flags();
        }

        info!(reason = reason.as_deref().unwrap_or("closed"), "disconnected");
        self.session.enter_waiting();
        self.publish_connection(
            names::CONNECTION_DISCONNECTED,
            ConnectionStatus::Disconnected { reason },
        );
    }

    /// Wait out the backoff for the next attempt. Returns `false` when the
    /// loop should stop instead.
    async fn schedule_recovery(
        &self,
        policy: &BackoffPolicy,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> bool {
        let attempt = self.reliability.next_attempt();
        if !policy.allows(attempt) {
            let attempts = attempt.saturating_sub(1);
            error!(attempts, "giving up on reconnecting");
            self.publish_connection(
                names::CONNECTION_FAILED,
                ConnectionStatus::Failed { attempts },
            );
            return false;
        }

        let (fire_tx, fire_rx) = oneshot::channel::<()>();
        let reliability = Arc::downgrade(&self.reliability);
        let delay = self.reliability.start_connection_recovery(
            attempt,
            move || reliability.upgrade().is_some_and(|r| r.is_connected()),
            move || {
                let _ = fire_tx.send(());
            },
            policy,
        );
        info!(attempt, ?delay, "reconnecting");
        self.publish_connection(
            names::CONNECTION_RECONNECTING,
            ConnectionStatus::Reconnecting { attempt, delay },
        );

        tokio::select! {
            _ = fire_rx => true,
            _ = shutdown_rx => false,
        }
    }

    // ── Server frames ───────────────────────────────────────────────

    /// Apply one server frame to the session.
    pub fn handle_server_message(&self, msg: ServerMessage) {
        if let Some(snapshot) = msg.phase_snapshot() {
            match msg {
                ServerMessage::ResultsPhaseStarted(payload) if !payload.players.is_empty() => {
                    self.session.apply_room_state(RoomSnapshot {
                        players: payload.players,
                        connected_count: None,
                        total_count: None,
                        phase: Some(snapshot),
                    });
                }
                ServerMessage::GamePaused(info) => {
                    self.session.apply_phase_update(snapshot);
                    self.events.publish_from(
                        names::GAME_PAUSED,
                        EventData::Paused(info.unwrap_or_default()),
                        SOURCE,
                    );
                }
                _ => self.session.apply_phase_update(snapshot),
            }
            return;
        }

        match msg {
            ServerMessage::RoomJoined(payload) => {
                let payload = *payload;
                info!(room_id = %payload.room_id, player_id = %payload.player_id, "joined room");
                let identity = StoredIdentity {
                    room_id: payload.room_id.clone(),
                    player_id: payload.player_id.clone(),
                    player_name: payload.player_name.clone(),
                };
                *self.join_target.lock() = Some(identity.clone().into());
                if let Err(e) = self.identity.save(&identity) {
                    warn!("coordinator: failed to save identity: {e}");
                }

                self.session.apply_room_joined(
                    RoomInfo {
                        room_id: Some(payload.room_id),
                        player_id: Some(payload.player_id),
                        player_name: Some(payload.player_name),
                        connected_count: payload.connected_count,
                        total_count: payload.total_count,
                    },
                    payload.players,
                );
                if let Some(game_state) = payload.game_state {
                    self.session.apply_phase_update(game_state);
                }
            }
            ServerMessage::RoomState(payload) => {
                self.session.apply_room_state((*payload).into());
            }
            ServerMessage::CountdownUpdate { time_remaining } => {
                self.session.update_time_remaining(time_remaining);
            }
            ServerMessage::PlayerJoined { player } => self.session.upsert_player(player),
            ServerMessage::PlayerLeft { player_id } => self.session.remove_player(&player_id),
            ServerMessage::Pong => debug!("pong"),
            ServerMessage::Error {
                message,
                error_code,
            } => {
                warn!(?error_code, "server error: {message}");
                if error_code.as_ref().is_none_or(|code| code.permits_retry()) {
                    self.session.reset_submission_flags();
                }
                self.events.publish_from(
                    names::SYSTEM_ERROR,
                    EventData::Error(ErrorReport {
                        message,
                        error_code,
                    }),
                    SOURCE,
                );
            }
            // Phase-bearing frames were handled above.
            ServerMessage::RoundStarted { .. }
            | ServerMessage::GuessingPhaseStarted { .. }
            | ServerMessage::ResultsPhaseStarted(_)
            | ServerMessage::GamePaused(_) => {}
        }
    }
}

impl Service for Coordinator {
    fn teardown(&self) -> std::result::Result<(), HandlerError> {
        self.abort();
        Ok(())
    }

    fn health(&self) -> Option<bool> {
        Some(self.is_running())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("connected", &self.is_connected())
            .field("running", &self.is_running())
            .field("join_target", &*self.join_target.lock())
            .finish()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error_codes::ErrorCode;
    use crate::identity::MemoryIdentityStore;
    use crate::session::{Phase, PhaseSnapshot, Response};
    use async_trait::async_trait;

    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            std::future::pending().await
        }
    }

    fn coordinator() -> (Coordinator, Arc<EventDispatcher>, Arc<SessionStateMachine>) {
        let events = Arc::new(EventDispatcher::new());
        let session = Arc::new(SessionStateMachine::new(Arc::clone(&events)));
        let coordinator = Coordinator::new(
            Arc::clone(&events),
            Arc::clone(&session),
            Arc::new(ConnectionReliability::new()),
            Arc::new(ClientConfig::default()),
            Arc::new(NeverConnects),
            Arc::new(MemoryIdentityStore::new()),
        );
        (coordinator, events, session)
    }

    fn collect(events: &EventDispatcher, name: &str) -> (Subscription, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = events.subscribe(name, move |event: &Event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        (sub, seen)
    }

    fn enter_guessing(session: &SessionStateMachine) {
        session.apply_phase_update(
            PhaseSnapshot::new(Phase::Guessing)
                .with_responses(vec![Response::new("a"), Response::new("b")]),
        );
    }

    #[test]
    fn guess_before_guessing_is_rejected_locally() {
        let (coordinator, events, session) = coordinator();
        let (_sub, errors) = collect(&events, names::SYSTEM_ERROR);

        coordinator.handle_intent(UserIntent::SubmitGuess { index: 0 });

        assert!(!session.guards().has_submitted_guess);
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn submission_while_disconnected_leaves_guard_clear() {
        let (coordinator, events, session) = coordinator();
        let (_sub, errors) = collect(&events, names::SYSTEM_ERROR);
        enter_guessing(&session);

        coordinator.handle_intent(UserIntent::SubmitGuess { index: 1 });

        assert!(!session.guards().has_submitted_guess);
        let errors = errors.lock();
        let EventData::Error(report) = &errors[0].data else {
            panic!("expected an error report");
        };
        assert_eq!(report.message, ClientError::NotConnected.to_string());
    }

    #[test]
    fn duplicate_submission_sends_once() {
        let (coordinator, _events, session) = coordinator();
        let mut rx = coordinator.cmd_rx.lock().take().unwrap();
        coordinator.reliability.mark_connected();
        enter_guessing(&session);

        coordinator.handle_intent(UserIntent::SubmitGuess { index: 1 });
        coordinator.handle_intent(UserIntent::SubmitGuess { index: 1 });

        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::SubmitGuess { guess_index: 1 }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_is_deferred_until_connected() {
        let (coordinator, _events, _session) = coordinator();
        let mut rx = coordinator.cmd_rx.lock().take().unwrap();

        coordinator.handle_intent(UserIntent::JoinRoom {
            room_id: "R1".into(),
            player_name: "Alice".into(),
        });
        assert!(rx.try_recv().is_err());

        coordinator.on_connected(0);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::JoinRoom {
                room_id: "R1".into(),
                player_name: "Alice".into(),
            }
        );
        coordinator.reliability.stop_all();
    }

    #[test]
    fn queued_submission_is_discarded_on_disconnect() {
        let (coordinator, _events, session) = coordinator();
        let mut rx = coordinator.cmd_rx.lock().take().unwrap();
        coordinator.reliability.mark_connected();
        session.apply_phase_update(PhaseSnapshot::new(Phase::Responding));

        coordinator.handle_intent(UserIntent::SubmitResponse {
            text: "blue".into(),
        });
        assert!(session.guards().has_submitted_response);

        coordinator.on_disconnected(&mut rx, None);

        assert!(rx.try_recv().is_err());
        assert!(!session.guards().has_submitted_response);
        assert!(!coordinator.is_connected());
    }

    #[test]
    fn shutdown_without_start_returns_immediately() {
        let (coordinator, _events, _session) = coordinator();
        tokio_test::block_on(coordinator.shutdown(Duration::from_secs(1)));
        assert!(!coordinator.is_running());
        assert!(!coordinator.is_connected());
    }

    #[test]
    fn retryable_server_error_clears_guards() {
        let (coordinator, events, session) = coordinator();
        let (_sub, errors) = collect(&events, names::SYSTEM_ERROR);
        enter_guessing(&session);
        assert!(session.mark_guess_submitted(0));

        coordinator.handle_server_message(ServerMessage::Error {
            message: "nope".into(),
            error_code: Some(ErrorCode::CannotGuessOwnResponse),
        });
        assert!(!session.guards().has_submitted_guess);
        assert_eq!(errors.lock().len(), 1);

        assert!(session.mark_guess_submitted(1));
        coordinator.handle_server_message(ServerMessage::Error {
            message: "again".into(),
            error_code: Some(ErrorCode::AlreadySubmitted),
        });
        assert!(session.guards().has_submitted_guess);
    }

    #[test]
    fn room_joined_saves_identity() {
        let store = Arc::new(MemoryIdentityStore::new());
        let events = Arc::new(EventDispatcher::new());
        let session = Arc::new(SessionStateMachine::new(Arc::clone(&events)));
        let coordinator = Coordinator::new(
            events,
            Arc::clone(&session),
            Arc::new(ConnectionReliability::new()),
            Arc::new(ClientConfig::default()),
            Arc::new(NeverConnects),
            store.clone(),
        );

        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "type": "room_joined",
            "data": {
                "room_id": "R1",
                "player_id": "p1",
                "player_name": "Alice",
                "players": [{"id": "p1", "name": "Alice"}, {"id": "p2", "name": "Bob"}],
                "connected_count": 2,
                "total_count": 2
            }
        }))
        .unwrap();
        coordinator.handle_server_message(msg);

        assert_eq!(store.load().unwrap().unwrap().player_id, "p1");
        assert_eq!(session.room_info().room_id.as_deref(), Some("R1"));
        assert!(session.can_start_round());
    }

    #[test]
    fn leave_resets_session_and_forgets_identity() {
        let (coordinator, events, session) = coordinator();
        let (_sub, left) = collect(&events, names::ROOM_LEFT);
        coordinator
            .identity
            .save(&StoredIdentity {
                room_id: "R1".into(),
                player_id: "p1".into(),
                player_name: "Alice".into(),
            })
            .unwrap();
        enter_guessing(&session);

        coordinator.handle_intent(UserIntent::LeaveRoom);

        assert_eq!(session.phase(), Phase::Waiting);
        assert!(coordinator.identity.load().unwrap().is_none());
        assert!(coordinator.join_target.lock().is_none());
        assert_eq!(left.lock().len(), 1);
    }

    #[test]
    fn leave_after_loop_stopped_reports_send_failure() {
        let (coordinator, events, session) = coordinator();
        let (_sub, errors) = collect(&events, names::SYSTEM_ERROR);
        drop(coordinator.cmd_rx.lock().take());
        coordinator.reliability.mark_connected();
        session.apply_room_joined(
            RoomInfo {
                room_id: Some("R1".into()),
                player_id: Some("p1".into()),
                player_name: Some("Alice".into()),
                connected_count: 1,
                total_count: 1,
            },
            vec![],
        );

        coordinator.handle_intent(UserIntent::LeaveRoom);

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        let EventData::Error(report) = &errors[0].data else {
            panic!("expected an error report");
        };
        assert!(report.message.starts_with("transport send error"));
        assert!(!session.room_info().in_room());
    }

    #[test]
    fn resolves_shared_services_from_registry() {
        let registry = ServiceRegistry::new();
        crate::client::register_services(
            &registry,
            ClientConfig::default(),
            Arc::new(NeverConnects),
            Arc::new(MemoryIdentityStore::new()),
        );

        let coordinator = Coordinator::from_registry(&registry).unwrap();
        let session: Arc<SessionStateMachine> = registry.get(services::SESSION).unwrap();
        let events: Arc<EventDispatcher> = registry.get(services::EVENTS).unwrap();
        assert!(Arc::ptr_eq(&coordinator.session, &session));
        assert!(Arc::ptr_eq(&coordinator.events, &events));
        assert!(!coordinator.is_running());
    }

    #[test]
    fn incomplete_registry_is_refused() {
        let registry = ServiceRegistry::new();
        registry.register(
            services::EVENTS,
            crate::registry::RegisterOptions::default(),
            |_, _| Ok(Arc::new(EventDispatcher::new())),
        );

        let err = Coordinator::from_registry(&registry).unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(name) if name == services::SESSION));
    }
}
