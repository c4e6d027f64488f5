//! Machine-readable codes carried by server `error` frames.
//!
//! On the wire they are `SCREAMING_SNAKE_CASE` strings such as
//! `"ROOM_NOT_FOUND"`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the server refused something.
///
/// Codes this client does not know deserialize to [`ErrorCode::Unknown`]
/// rather than failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request validation
    InvalidInput,
    InvalidRoomId,
    InvalidPlayerName,
    MessageTooLarge,

    // Room membership
    RoomNotFound,
    RoomFull,
    AlreadyInRoom,
    NotInRoom,

    // Round flow
    NotEnoughPlayers,
    RoundInProgress,
    InvalidPhase,
    AlreadySubmitted,
    InvalidResponse,
    InvalidGuess,
    CannotGuessOwnResponse,

    // Server side
    RateLimitExceeded,
    InternalError,
    ServiceUnavailable,

    /// Any code not listed above.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// One-sentence explanation suitable for showing to a player.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidInput => "The server could not understand that request.",
            Self::InvalidRoomId => "That room code is not valid.",
            Self::InvalidPlayerName => "That name is empty or too long.",
            Self::MessageTooLarge => "That message is too large to send.",
            Self::RoomNotFound => "No room exists with that code.",
            Self::RoomFull => "That room has no free seats.",
            Self::AlreadyInRoom => "Leave your current room before joining another one.",
            Self::NotInRoom => "Join a room first.",
            Self::NotEnoughPlayers => "A round needs at least two connected players.",
            Self::RoundInProgress => "A round is already running in this room.",
            Self::InvalidPhase => "That action does not fit the current phase of the round.",
            Self::AlreadySubmitted => "You already submitted in this phase.",
            Self::InvalidResponse => "Responses must be non-empty and not too long.",
            Self::InvalidGuess => "That guess does not match any response in this round.",
            Self::CannotGuessOwnResponse => "You cannot pick your own response.",
            Self::RateLimitExceeded => "Slow down; too many requests were sent.",
            Self::InternalError => "The server hit an internal error.",
            Self::ServiceUnavailable => "The server is unavailable right now.",
            Self::Unknown => "The server reported an unrecognized error.",
        }
    }

    /// Returns `true` if this error rejects a submission the player may retry.
    ///
    /// The client clears its submission guards when it sees one of these.
    /// [`AlreadySubmitted`](Self::AlreadySubmitted) is excluded: the server
    /// already holds the submission.
    pub fn permits_retry(&self) -> bool {
        matches!(
            self,
            Self::InvalidPhase
                | Self::InvalidResponse
                | Self::InvalidGuess
                | Self::CannotGuessOwnResponse
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_fall_back() {
        let code: ErrorCode = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
    }

    #[test]
    fn known_codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::CannotGuessOwnResponse).unwrap();
        assert_eq!(json, "\"CANNOT_GUESS_OWN_RESPONSE\"");
    }

    #[test]
    fn retryable_rejections() {
        assert!(ErrorCode::InvalidGuess.permits_retry());
        assert!(!ErrorCode::AlreadySubmitted.permits_retry());
        assert!(!ErrorCode::RoomFull.permits_retry());
    }
}
