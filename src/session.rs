//! Canonical session phase and submission guards.
//!
//! [`SessionStateMachine`] is the single writer of [`SessionState`]. Every
//! accepted mutation finishes under the state lock and is only then broadcast
//! on the [`EventDispatcher`], so subscribers always observe a complete state.
//!
//! ```text
//! Waiting ──▶ Responding ──▶ Guessing ──▶ Results ──▶ Waiting
//!    ▲                                                  │
//!    └───────────── pause / error / disconnect ─────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dispatcher::EventDispatcher;
use crate::event::{names, EventData, TimerUpdate, UserAction};
use crate::registry::Service;

/// Connected players required before a round may start.
pub const MIN_PLAYERS_TO_START: u32 = 2;

const SOURCE: &str = "session";

// ── Data model ──────────────────────────────────────────────────────

/// One of the four mutually exclusive stages of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Waiting,
    Responding,
    Guessing,
    Results,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "waiting",
            Self::Responding => "responding",
            Self::Guessing => "guessing",
            Self::Results => "results",
        };
        f.write_str(name)
    }
}

/// The prompt players respond to during a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            id: None,
        }
    }
}

/// A response shown to players during guessing and results.
///
/// Serialized as a bare JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response {
    pub text: String,
}

impl Response {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A participant in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    #[serde(default = "default_connected")]
    pub connected: bool,
    #[serde(default)]
    pub score: i64,
}

fn default_connected() -> bool {
    true
}

/// Room membership for the local participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: Option<String>,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
    pub connected_count: u32,
    pub total_count: u32,
}

impl RoomInfo {
    /// Returns `true` if the local participant holds a room.
    pub fn in_room(&self) -> bool {
        self.room_id.is_some()
    }
}

/// Flags preventing duplicate submissions within a phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionGuards {
    pub has_submitted_response: bool,
    pub submitted_response_text: Option<String>,
    pub has_submitted_guess: bool,
    pub submitted_guess_index: Option<usize>,
}

impl SubmissionGuards {
    fn clear_response(&mut self) {
        self.has_submitted_response = false;
        self.submitted_response_text = None;
    }

    fn clear_guess(&mut self) {
        self.has_submitted_guess = false;
        self.submitted_guess_index = None;
    }
}

/// The single source of truth for the local view of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub round_number: u32,
    pub prompt: Option<Prompt>,
    /// Only populated in [`Phase::Guessing`] and [`Phase::Results`].
    pub responses: Vec<Response>,
    /// Length of the current phase in seconds.
    pub phase_duration: Option<u32>,
    /// Seconds left in the current phase.
    pub time_remaining: Option<u32>,
    pub room_info: RoomInfo,
    pub players: Vec<Player>,
    pub guards: SubmissionGuards,
}

impl SessionState {
    /// Responses the local participant may guess from, excluding their own.
    pub fn visible_responses(&self) -> Vec<(Response, usize)> {
        visible_responses(self, self.guards.submitted_response_text.as_deref())
    }
}

/// A phase update as announced by the server.
///
/// Fields left `None` keep their current value where that makes sense for
/// the phase being entered (see [`SessionStateMachine::apply_phase_update`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Prompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<Response>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u32>,
}

impl PhaseSnapshot {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            round_number: None,
            prompt: None,
            responses: None,
            phase_duration: None,
            time_remaining: None,
        }
    }

    #[must_use]
    pub fn with_round_number(mut self, round_number: u32) -> Self {
        self.round_number = Some(round_number);
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    #[must_use]
    pub fn with_responses(mut self, responses: Vec<Response>) -> Self {
        self.responses = Some(responses);
        self
    }

    #[must_use]
    pub fn with_phase_duration(mut self, seconds: u32) -> Self {
        self.phase_duration = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_time_remaining(mut self, seconds: u32) -> Self {
        self.time_remaining = Some(seconds);
        self
    }
}

/// Roster and phase information carried by a full room refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub players: Vec<Player>,
    pub connected_count: Option<u32>,
    pub total_count: Option<u32>,
    pub phase: Option<PhaseSnapshot>,
}

/// Why a user action was refused locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    /// The action is not legal in the current phase.
    #[error("cannot {action} during the {phase} phase")]
    WrongPhase { action: &'static str, phase: Phase },

    /// The guard for this phase is already set.
    #[error("already submitted a {0} this phase")]
    AlreadySubmitted(&'static str),

    /// Fewer than [`MIN_PLAYERS_TO_START`] players are connected.
    #[error("need at least {required} connected players to start, have {connected}")]
    NotEnoughPlayers { connected: u32, required: u32 },

    /// The guess does not point at a visible response.
    #[error("guess index {index} is out of range for {available} responses")]
    InvalidGuessIndex { index: usize, available: usize },

    /// The response text is blank.
    #[error("response text is empty")]
    EmptyResponse,
}

// ── Derived view ────────────────────────────────────────────────────

/// Responses the local participant may pick from, paired with their index in
/// `state.responses`.
///
/// The first response whose trimmed text equals `self_text` is treated as the
/// participant's own and left out. Indices are never remapped, so the index
/// carried here is the one to send with a guess.
pub fn visible_responses(state: &SessionState, self_text: Option<&str>) -> Vec<(Response, usize)> {
    let own = self_text.map(str::trim).filter(|t| !t.is_empty());
    let mut skipped = false;
    state
        .responses
        .iter()
        .enumerate()
        .filter(|(_, response)| {
            if skipped {
                return true;
            }
            match own {
                Some(text) if response.text.trim() == text => {
                    skipped = true;
                    false
                }
                _ => true,
            }
        })
        .map(|(index, response)| (response.clone(), index))
        .collect()
}

// ── State machine ───────────────────────────────────────────────────

/// Owner of the canonical [`SessionState`].
///
/// Only the coordinator calls the mutating methods; everything else reads via
/// the query methods or the `state-changed` broadcast.
pub struct SessionStateMachine {
    state: Mutex<SessionState>,
    events: Arc<EventDispatcher>,
}

impl SessionStateMachine {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            events,
        }
    }

    // ── Intents ─────────────────────────────────────────────────────

    /// Apply a phase update from the server.
    ///
    /// Entering [`Phase::Responding`] clears the response guard and entering
    /// [`Phase::Guessing`] clears the guess guard; no other transition touches
    /// either guard. Publishes `phase-changed` if the phase differs, then
    /// always `state-changed`.
    pub fn apply_phase_update(&self, snapshot: PhaseSnapshot) {
        let (transition, state) = {
            let mut state = self.state.lock();
            let transition = apply_snapshot(&mut state, snapshot);
            (transition, state.clone())
        };
        self.broadcast(transition, state);
    }

    /// Record a successful room join for the local participant.
    pub fn apply_room_joined(&self, room_info: RoomInfo, players: Vec<Player>) {
        let state = {
            let mut state = self.state.lock();
            state.room_info = room_info;
            if !players.is_empty() {
                state.players = players;
                recount(&mut state);
            }
            state.clone()
        };
        debug!(room_id = ?state.room_info.room_id, "session: joined room");
        self.events.publish_from(
            names::ROOM_JOINED,
            EventData::Room(state.room_info.clone()),
            SOURCE,
        );
        self.broadcast(None, state);
    }

    /// Apply a full room refresh: roster, counts and optionally the phase.
    pub fn apply_room_state(&self, room: RoomSnapshot) {
        let (transition, state) = {
            let mut state = self.state.lock();
            state.players = room.players;
            recount(&mut state);
            if let Some(connected) = room.connected_count {
                state.room_info.connected_count = connected;
            }
            if let Some(total) = room.total_count {
                state.room_info.total_count = total;
            }
            let transition = room
                .phase
                .and_then(|snapshot| apply_snapshot(&mut state, snapshot));
            (transition, state.clone())
        };
        self.broadcast(transition, state);
    }

    /// Add or replace a player in the roster.
    pub fn upsert_player(&self, player: Player) {
        let state = {
            let mut state = self.state.lock();
            match state.players.iter_mut().find(|p| p.id == player.id) {
                Some(existing) => *existing = player,
                None => state.players.push(player),
            }
            recount(&mut state);
            state.clone()
        };
        self.broadcast(None, state);
    }

    /// Remove a player from the roster.
    pub fn remove_player(&self, player_id: &str) {
        let state = {
            let mut state = self.state.lock();
            let before = state.players.len();
            state.players.retain(|p| p.id != player_id);
            if state.players.len() == before {
                return;
            }
            recount(&mut state);
            state.clone()
        };
        self.broadcast(None, state);
    }

    /// Update the countdown for the current phase.
    ///
    /// Publishes `timer:update`, plus `timer:expired` the first time the
    /// countdown reaches zero, then `state-changed` with the new
    /// `time_remaining`.
    pub fn update_time_remaining(&self, seconds: u32) {
        let (update, expired, state) = {
            let mut state = self.state.lock();
            let previous = state.time_remaining.replace(seconds);
            let update = TimerUpdate {
                phase: state.phase,
                time_remaining: seconds,
                phase_duration: state.phase_duration,
            };
            (update, seconds == 0 && previous != Some(0), state.clone())
        };
        self.events
            .publish_from(names::TIMER_UPDATE, EventData::Timer(update.clone()), SOURCE);
        if expired {
            self.events
                .publish_from(names::TIMER_EXPIRED, EventData::Timer(update), SOURCE);
        }
        self.broadcast(None, state);
    }

    /// Return to [`Phase::Waiting`] after a pause, error or disconnect.
    pub fn enter_waiting(&self) {
        self.apply_phase_update(PhaseSnapshot::new(Phase::Waiting));
    }

    /// Replace the whole state with a fresh one. Used when leaving a room.
    pub fn reset(&self) {
        let (old, state) = {
            let mut state = self.state.lock();
            let old = state.phase;
            *state = SessionState::default();
            (old, state.clone())
        };
        let transition = (old != state.phase).then_some((old, state.phase));
        self.broadcast(transition, state);
    }

    /// Set the response guard. Returns `true` if it was not already set.
    pub fn mark_response_submitted(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        {
            let mut state = self.state.lock();
            if state.guards.has_submitted_response {
                return false;
            }
            state.guards.has_submitted_response = true;
            state.guards.submitted_response_text = Some(text.clone());
        }
        self.events.publish_from(
            names::USER_ACTION,
            EventData::UserAction(UserAction::ResponseSubmitted { text }),
            SOURCE,
        );
        true
    }

    /// Set the guess guard. Returns `true` if it was not already set.
    pub fn mark_guess_submitted(&self, index: usize) -> bool {
        {
            let mut state = self.state.lock();
            if state.guards.has_submitted_guess {
                return false;
            }
            state.guards.has_submitted_guess = true;
            state.guards.submitted_guess_index = Some(index);
        }
        self.events.publish_from(
            names::USER_ACTION,
            EventData::UserAction(UserAction::GuessSubmitted { index }),
            SOURCE,
        );
        true
    }

    /// Clear both guards without changing phase, after a rejected submission.
    pub fn reset_submission_flags(&self) {
        let state = {
            let mut state = self.state.lock();
            state.guards.clear_response();
            state.guards.clear_guess();
            state.clone()
        };
        self.broadcast(None, state);
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// A copy of the full current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn room_info(&self) -> RoomInfo {
        self.state.lock().room_info.clone()
    }

    pub fn guards(&self) -> SubmissionGuards {
        self.state.lock().guards.clone()
    }

    pub fn can_start_round(&self) -> bool {
        self.check_start_round().is_ok()
    }

    pub fn can_submit_response(&self) -> bool {
        self.check_submit_response().is_ok()
    }

    pub fn can_submit_guess(&self) -> bool {
        let state = self.state.lock();
        state.phase == Phase::Guessing && !state.guards.has_submitted_guess
    }

    /// Like [`can_start_round`](Self::can_start_round) but says why not.
    pub fn check_start_round(&self) -> Result<(), GuardViolation> {
        let state = self.state.lock();
        if state.phase != Phase::Waiting {
            return Err(GuardViolation::WrongPhase {
                action: "start a round",
                phase: state.phase,
            });
        }
        let connected = state.room_info.connected_count;
        if connected < MIN_PLAYERS_TO_START {
            return Err(GuardViolation::NotEnoughPlayers {
                connected,
                required: MIN_PLAYERS_TO_START,
            });
        }
        Ok(())
    }

    /// Like [`can_submit_response`](Self::can_submit_response) but says why not.
    pub fn check_submit_response(&self) -> Result<(), GuardViolation> {
        let state = self.state.lock();
        if state.phase != Phase::Responding {
            return Err(GuardViolation::WrongPhase {
                action: "submit a response",
                phase: state.phase,
            });
        }
        if state.guards.has_submitted_response {
            return Err(GuardViolation::AlreadySubmitted("response"));
        }
        Ok(())
    }

    /// Checks the guess guard and that `index` names a known response.
    pub fn check_submit_guess(&self, index: usize) -> Result<(), GuardViolation> {
        let state = self.state.lock();
        if state.phase != Phase::Guessing {
            return Err(GuardViolation::WrongPhase {
                action: "submit a guess",
                phase: state.phase,
            });
        }
        if state.guards.has_submitted_guess {
            return Err(GuardViolation::AlreadySubmitted("guess"));
        }
        let available = state.responses.len();
        if index >= available {
            return Err(GuardViolation::InvalidGuessIndex { index, available });
        }
        Ok(())
    }

    /// Responses the local participant may guess from.
    pub fn visible_responses(&self) -> Vec<(Response, usize)> {
        self.state.lock().visible_responses()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn broadcast(&self, transition: Option<(Phase, Phase)>, state: SessionState) {
        if let Some((old, new)) = transition {
            debug!(%old, %new, "session: phase changed");
            self.events
                .publish_from(names::PHASE_CHANGED, EventData::PhaseChanged { old, new }, SOURCE);
        }
        self.events.publish_from(
            names::STATE_CHANGED,
            EventData::StateChanged(Box::new(state)),
            SOURCE,
        );
    }
}

impl Service for SessionStateMachine {}

impl fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStateMachine")
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Apply `snapshot` to `state`, returning the phase transition if any.
fn apply_snapshot(state: &mut SessionState, snapshot: PhaseSnapshot) -> Option<(Phase, Phase)> {
    let old = state.phase;
    let new = snapshot.phase;
    let changed = old != new;

    if changed {
        match new {
            Phase::Responding => state.guards.clear_response(),
            Phase::Guessing => state.guards.clear_guess(),
            Phase::Waiting | Phase::Results => {}
        }
        state.phase = new;
    }

    if let Some(round) = snapshot.round_number {
        state.round_number = round;
    }

    match snapshot.prompt {
        Some(prompt) => state.prompt = Some(prompt),
        None if changed && new == Phase::Waiting => state.prompt = None,
        None => {}
    }

    match new {
        Phase::Guessing | Phase::Results => {
            if let Some(responses) = snapshot.responses {
                state.responses = responses;
            } else if changed && new == Phase::Guessing {
                state.responses.clear();
            }
        }
        Phase::Waiting | Phase::Responding => state.responses.clear(),
    }

    state.phase_duration = snapshot.phase_duration;
    state.time_remaining = snapshot.time_remaining.or(snapshot.phase_duration);

    changed.then_some((old, new))
}

fn recount(state: &mut SessionState) {
    let connected = state.players.iter().filter(|p| p.connected).count();
    state.room_info.connected_count = u32::try_from(connected).unwrap_or(u32::MAX);
    state.room_info.total_count = u32::try_from(state.players.len()).unwrap_or(u32::MAX);
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
    use crate::event::Event;

    fn machine() -> (SessionStateMachine, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(EventDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in [
            names::PHASE_CHANGED,
            names::STATE_CHANGED,
            names::USER_ACTION,
            names::TIMER_UPDATE,
            names::TIMER_EXPIRED,
        ] {
            let seen = Arc::clone(&seen);
            let _ = events.subscribe(name, move |event: &Event| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }
        (SessionStateMachine::new(events), seen)
    }

    fn count(seen: &Mutex<Vec<Event>>, name: &str) -> usize {
        seen.lock().iter().filter(|e| e.name == name).count()
    }

    fn with_players(machine: &SessionStateMachine, connected: u32) {
        machine.apply_room_joined(
            RoomInfo {
                room_id: Some("room-1".into()),
                player_id: Some("p1".into()),
                player_name: Some("Alice".into()),
                connected_count: connected,
                total_count: connected,
            },
            vec![],
        );
    }

    #[test]
    fn starts_waiting_with_clear_guards() {
        let (machine, _) = machine();
        assert_eq!(machine.phase(), Phase::Waiting);
        assert_eq!(machine.guards(), SubmissionGuards::default());
        assert!(!machine.can_submit_response());
        assert!(!machine.can_submit_guess());
    }

    #[test]
    fn entering_responding_publishes_one_phase_and_one_state_change() {
        let (machine, seen) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding).with_phase_duration(180));

        let state = machine.snapshot();
        assert_eq!(state.phase, Phase::Responding);
        assert_eq!(state.time_remaining, Some(180));
        assert!(!state.guards.has_submitted_response);
        assert_eq!(count(&seen, names::PHASE_CHANGED), 1);
        assert_eq!(count(&seen, names::STATE_CHANGED), 1);

        let first = seen.lock()[0].clone();
        assert!(matches!(
            first.data,
            EventData::PhaseChanged {
                old: Phase::Waiting,
                new: Phase::Responding
            }
        ));
    }

    #[test]
    fn same_phase_update_only_publishes_state_change() {
        let (machine, seen) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Waiting));
        assert_eq!(count(&seen, names::PHASE_CHANGED), 0);
        assert_eq!(count(&seen, names::STATE_CHANGED), 1);
    }

    #[test]
    fn entering_responding_resets_response_guard_only() {
        let (machine, _) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        assert!(machine.mark_response_submitted("mine"));
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing));
        assert!(machine.mark_guess_submitted(0));

        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        let guards = machine.guards();
        assert!(!guards.has_submitted_response);
        assert_eq!(guards.submitted_response_text, None);
        assert!(guards.has_submitted_guess);
    }

    #[test]
    fn entering_guessing_resets_guess_guard_only() {
        let (machine, _) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing));
        assert!(machine.mark_guess_submitted(1));
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        assert!(machine.mark_response_submitted("mine"));

        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing));
        let guards = machine.guards();
        assert!(!guards.has_submitted_guess);
        assert!(guards.has_submitted_response);
    }

    #[test]
    fn other_phases_leave_guards_untouched() {
        let (machine, _) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        machine.mark_response_submitted("mine");
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing));
        machine.mark_guess_submitted(0);

        let before = machine.guards();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Results));
        assert_eq!(machine.guards(), before);
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Waiting));
        assert_eq!(machine.guards(), before);
    }

    #[test]
    fn guess_guard_stays_set_until_next_guessing_entry() {
        let (machine, _) = machine();
        machine.apply_phase_update(
            PhaseSnapshot::new(Phase::Guessing)
                .with_responses(vec![Response::new("a"), Response::new("b")]),
        );
        assert!(machine.can_submit_guess());
        assert!(machine.mark_guess_submitted(1));
        assert!(!machine.can_submit_guess());

        // Same-phase refresh does not count as entry.
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing).with_time_remaining(10));
        assert!(!machine.can_submit_guess());

        machine.apply_phase_update(PhaseSnapshot::new(Phase::Results));
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing));
        assert!(machine.can_submit_guess());
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let (machine, seen) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        assert!(machine.mark_response_submitted("first"));
        assert!(!machine.mark_response_submitted("second"));
        assert_eq!(
            machine.guards().submitted_response_text.as_deref(),
            Some("first")
        );
        assert_eq!(count(&seen, names::USER_ACTION), 1);
    }

    #[test]
    fn reset_submission_flags_keeps_phase() {
        let (machine, _) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        machine.mark_response_submitted("x");
        machine.reset_submission_flags();
        assert_eq!(machine.phase(), Phase::Responding);
        assert!(machine.can_submit_response());
    }

    #[test]
    fn can_start_round_requires_two_connected_in_waiting() {
        let (machine, _) = machine();
        with_players(&machine, 1);
        assert_eq!(
            machine.check_start_round(),
            Err(GuardViolation::NotEnoughPlayers {
                connected: 1,
                required: 2
            })
        );
        with_players(&machine, 2);
        assert!(machine.can_start_round());
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding));
        assert!(!machine.can_start_round());
    }

    #[test]
    fn check_submit_guess_rejects_out_of_range() {
        let (machine, _) = machine();
        machine.apply_phase_update(
            PhaseSnapshot::new(Phase::Guessing).with_responses(vec![Response::new("a")]),
        );
        assert_eq!(
            machine.check_submit_guess(3),
            Err(GuardViolation::InvalidGuessIndex {
                index: 3,
                available: 1
            })
        );
        assert!(machine.check_submit_guess(0).is_ok());
    }

    #[test]
    fn responses_only_kept_in_guessing_and_results() {
        let (machine, _) = machine();
        machine.apply_phase_update(
            PhaseSnapshot::new(Phase::Guessing).with_responses(vec![Response::new("a")]),
        );
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Results));
        assert_eq!(machine.snapshot().responses.len(), 1);
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Waiting));
        assert!(machine.snapshot().responses.is_empty());
    }

    #[test]
    fn prompt_survives_until_waiting() {
        let (machine, _) = machine();
        machine.apply_phase_update(
            PhaseSnapshot::new(Phase::Responding)
                .with_round_number(3)
                .with_prompt(Prompt::new("Name a fruit")),
        );
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing));
        let state = machine.snapshot();
        assert_eq!(state.round_number, 3);
        assert_eq!(state.prompt, Some(Prompt::new("Name a fruit")));

        machine.enter_waiting();
        assert_eq!(machine.snapshot().prompt, None);
        assert_eq!(machine.snapshot().round_number, 3);
    }

    #[test]
    fn subscriber_observes_complete_state() {
        let events = Arc::new(EventDispatcher::new());
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let _ = events.subscribe(names::PHASE_CHANGED, move |_event: &Event| Ok(()));
        let _ = events.subscribe(names::STATE_CHANGED, move |event: &Event| {
            if let EventData::StateChanged(state) = &event.data {
                *sink.lock() = Some((state.phase, state.time_remaining, state.round_number));
            }
            Ok(())
        });
        let machine = SessionStateMachine::new(events);
        machine.apply_phase_update(
            PhaseSnapshot::new(Phase::Responding)
                .with_round_number(2)
                .with_phase_duration(60),
        );
        assert_eq!(
            *observed.lock(),
            Some((Phase::Responding, Some(60), 2))
        );
    }

    #[test]
    fn countdown_publishes_expiry_once() {
        let (machine, seen) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Responding).with_phase_duration(2));
        machine.update_time_remaining(1);
        machine.update_time_remaining(0);
        machine.update_time_remaining(0);
        assert_eq!(count(&seen, names::TIMER_UPDATE), 3);
        assert_eq!(count(&seen, names::TIMER_EXPIRED), 1);
        assert_eq!(machine.snapshot().time_remaining, Some(0));
    }

    #[test]
    fn countdown_reaches_state_subscribers() {
        let (machine, seen) = machine();
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Guessing).with_phase_duration(30));
        machine.update_time_remaining(12);

        let events = seen.lock();
        let last = events.last().unwrap();
        assert_eq!(last.name, names::STATE_CHANGED);
        assert_eq!(last.state().unwrap().time_remaining, Some(12));
    }

    #[test]
    fn roster_updates_recount_players() {
        let (machine, _) = machine();
        machine.upsert_player(Player {
            id: "a".into(),
            name: "A".into(),
            connected: true,
            score: 0,
        });
        machine.upsert_player(Player {
            id: "b".into(),
            name: "B".into(),
            connected: false,
            score: 0,
        });
        let info = machine.room_info();
        assert_eq!((info.connected_count, info.total_count), (1, 2));

        machine.remove_player("b");
        let info = machine.room_info();
        assert_eq!((info.connected_count, info.total_count), (1, 1));

        machine.remove_player("a");
        let info = machine.room_info();
        assert_eq!((info.connected_count, info.total_count), (0, 0));
    }

    #[test]
    fn emptied_roster_cannot_start_a_round() {
        let (machine, _) = machine();
        for id in ["p1", "p2"] {
            machine.upsert_player(Player {
                id: id.into(),
                name: id.into(),
                connected: true,
                score: 0,
            });
        }
        assert!(machine.can_start_round());

        machine.apply_room_state(RoomSnapshot {
            players: vec![],
            connected_count: None,
            total_count: None,
            phase: None,
        });
        let info = machine.room_info();
        assert_eq!((info.connected_count, info.total_count), (0, 0));
        assert!(!machine.can_start_round());
    }

    #[test]
    fn explicit_room_counts_override_the_roster() {
        let (machine, _) = machine();
        machine.apply_room_state(RoomSnapshot {
            players: vec![],
            connected_count: Some(3),
            total_count: Some(4),
            phase: None,
        });
        let info = machine.room_info();
        assert_eq!((info.connected_count, info.total_count), (3, 4));
        assert!(machine.can_start_round());
    }

    #[test]
    fn visible_responses_skip_own_and_keep_original_indices() {
        let state = SessionState {
            phase: Phase::Guessing,
            responses: vec![
                Response::new("banana"),
                Response::new("apple"),
                Response::new("cherry"),
            ],
            ..SessionState::default()
        };
        let visible = visible_responses(&state, Some(" apple "));
        let indices: Vec<usize> = visible.iter().map(|(_, i)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(visible[1].0.text, "cherry");

        assert_eq!(visible_responses(&state, None).len(), 3);
    }

    #[test]
    fn visible_responses_skip_only_one_duplicate() {
        let state = SessionState {
            responses: vec![Response::new("same"), Response::new("same")],
            ..SessionState::default()
        };
        assert_eq!(visible_responses(&state, Some("same")), vec![(Response::new("same"), 1)]);
    }

    #[test]
    fn reset_returns_to_default() {
        let (machine, seen) = machine();
        with_players(&machine, 3);
        machine.apply_phase_update(PhaseSnapshot::new(Phase::Results));
        seen.lock().clear();

        machine.reset();
        assert_eq!(machine.snapshot(), SessionState::default());
        assert_eq!(count(&seen, names::PHASE_CHANGED), 1);
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Guessing).unwrap(), "\"guessing\"");
    }
}
