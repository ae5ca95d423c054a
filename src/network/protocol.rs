//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object carrying a `request_type` tag. Inbound frames
//! put their arguments under `data`; outbound frames flatten their fields next
//! to the tag, except `new-player-success` and `game-state` which keep `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Register a player on the connection.
pub const NEW_PLAYER: &str = "new-player";
/// Ask for an opponent.
pub const ENTER_DUEL: &str = "enter-duel";
/// Leave the registry (and resign any running duel).
pub const SIGN_OUT: &str = "sign-out";
/// Opaque in-duel state, relayed to the opponent.
pub const GAME_STATE: &str = "game-state";
/// Duel finished, carries the declared winner.
pub const GAME_END: &str = "game-end";

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Raw inbound envelope, before the payload is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Request type tag.
    pub request_type: String,
    /// Free-form payload.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parse an envelope from a JSON text frame.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|_| ProtocolError::Malformed)
    }
}

/// Decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `new-player{username}`
    NewPlayer {
        /// Requested display name.
        username: String,
    },
    /// `enter-duel{}`
    EnterDuel,
    /// `sign-out{}`
    SignOut,
    /// `game-state{data}`; the payload is never inspected.
    GameState(Value),
    /// `game-end{data:{player_won}}`
    GameEnd(GameEndData),
}

/// Payload of a `new-player` request.
#[derive(Debug, Clone, Deserialize)]
struct NewPlayerData {
    username: String,
}

/// Payload of a `game-end` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEndData {
    /// Username the sender declares as the winner.
    pub player_won: String,
}

impl ClientMessage {
    /// Interpret an envelope. Errors are scoped to the envelope's request type.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.request_type.as_str() {
            NEW_PLAYER => {
                let data: NewPlayerData = serde_json::from_value(envelope.data)
                    .map_err(|_| ProtocolError::MissingUsername)?;
                Ok(ClientMessage::NewPlayer { username: data.username })
            }
            ENTER_DUEL => Ok(ClientMessage::EnterDuel),
            SIGN_OUT => Ok(ClientMessage::SignOut),
            GAME_STATE => Ok(ClientMessage::GameState(envelope.data)),
            GAME_END => serde_json::from_value(envelope.data)
                .map(ClientMessage::GameEnd)
                .map_err(|_| ProtocolError::MissingWinner),
            other => Err(ProtocolError::UnknownRequestType(other.to_string())),
        }
    }

    /// Parse straight from a JSON text frame.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::from_json(json)?)
    }

    /// The request type this message was sent as.
    pub fn request_type(&self) -> &'static str {
        match self {
            ClientMessage::NewPlayer { .. } => NEW_PLAYER,
            ClientMessage::EnterDuel => ENTER_DUEL,
            ClientMessage::SignOut => SIGN_OUT,
            ClientMessage::GameState(_) => GAME_STATE,
            ClientMessage::GameEnd(_) => GAME_END,
        }
    }
}

/// Malformed inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope.
    #[error("Failed to decode JSON")]
    Malformed,

    /// `new-player` without a string username.
    #[error("Missing username")]
    MissingUsername,

    /// `game-end` without a string `player_won`.
    #[error("Missing winner")]
    MissingWinner,

    /// Request type nobody handles.
    #[error("Unknown request type \"{0}\"")]
    UnknownRequestType(String),
}

impl ProtocolError {
    /// Request type the error reply is scoped to (empty for undecodable frames).
    pub fn scope(&self) -> &str {
        match self {
            ProtocolError::Malformed => "",
            ProtocolError::MissingUsername => NEW_PLAYER,
            ProtocolError::MissingWinner => GAME_END,
            ProtocolError::UnknownRequestType(ty) => ty,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registration accepted.
    NewPlayerSuccess {
        /// Echo of the registered name.
        data: NewPlayerAck,
    },

    /// Full player list, highest rank first.
    PlayersUpdate {
        /// Registered players.
        players: Vec<PlayerSummary>,
    },

    /// Matchmaking progress.
    EnterDuel(EnterDuelStatus),

    /// Opponent's opaque game state.
    GameState {
        /// Payload exactly as the opponent sent it.
        data: Value,
    },

    /// Duel result for the receiving player.
    GameEnd(DuelResult),

    /// Scoped failure (`<request_type>-error` or plain `error`).
    #[serde(untagged)]
    Error(ServerError),
}

/// Body of `new-player-success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlayerAck {
    /// Registered username.
    pub username: String,
}

/// One row of the player list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSummary {
    /// Player name.
    pub username: String,
    /// Current rank.
    pub rank: f64,
}

/// Matchmaking status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MatchmakingStatus {
    /// Searching for an opponent.
    Matchmaking,
    /// Opponent found, duel running.
    Found,
}

impl From<MatchmakingStatus> for u8 {
    fn from(status: MatchmakingStatus) -> u8 {
        match status {
            MatchmakingStatus::Matchmaking => 0,
            MatchmakingStatus::Found => 1,
        }
    }
}

impl TryFrom<u8> for MatchmakingStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MatchmakingStatus::Matchmaking),
            1 => Ok(MatchmakingStatus::Found),
            other => Err(format!("unknown matchmaking status {}", other)),
        }
    }
}

/// Seat assigned to each side of a duel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    /// The player whose search found the match.
    Left,
    /// The opponent.
    Right,
}

/// Body of an `enter-duel` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterDuelStatus {
    /// Human readable progress.
    pub message: String,
    /// Status code.
    pub status: MatchmakingStatus,
    /// Seat, once found.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<Seat>,
    /// Opponent, once found.
    #[serde(rename = "match", skip_serializing_if = "Option::is_none", default)]
    pub opponent: Option<PlayerSummary>,
}

/// Body of a `game-end` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuelResult {
    /// Winner's username.
    pub result: String,
    /// Receiver's rank after resolution.
    pub new_rank: f64,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// `<scope>-error`, or `error` for unscoped failures.
    pub request_type: String,
    /// Explanation.
    pub message: String,
}

impl ServerMessage {
    /// Error reply scoped to a request type.
    pub fn error(scope: &str, message: impl Into<String>) -> Self {
        let request_type = if scope.is_empty() {
            "error".to_string()
        } else {
            format!("{}-error", scope)
        };
        ServerMessage::Error(ServerError {
            request_type,
            message: message.into(),
        })
    }

    /// `enter-duel` acknowledgment sent when a search starts.
    pub fn searching() -> Self {
        ServerMessage::EnterDuel(EnterDuelStatus {
            message: "Matchmaking...".to_string(),
            status: MatchmakingStatus::Matchmaking,
            position: None,
            opponent: None,
        })
    }

    /// `enter-duel` acknowledgment naming the opponent.
    pub fn duel_found(seat: Seat, opponent: PlayerSummary) -> Self {
        ServerMessage::EnterDuel(EnterDuelStatus {
            message: format!("Successfully started duel with \"{}\"", opponent.username),
            status: MatchmakingStatus::Found,
            position: Some(seat),
            opponent: Some(opponent),
        })
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
