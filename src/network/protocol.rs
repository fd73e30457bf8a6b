//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every
//! message is a JSON object tagged by `type`; binary frames carry the same
//! JSON as UTF-8 bytes.

use serde::{Serialize, Deserialize};

use crate::core::tile::{Placement, Tile};
use crate::game::engine::{EngineError, IllegalAction};
use crate::game::player::PlayerKey;
use crate::game::session::{GameConfig, SessionError, SessionKey, SessionSummary};
use crate::game::turn::Turn;
use crate::network::manager::ManagerError;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new session.
    Create {
        /// Options; defaults when absent.
        #[serde(default)]
        config: Option<GameConfig>,
    },

    /// Attach this connection to a session, as a player or an observer.
    Join {
        /// Session to follow.
        session_key: SessionKey,
        /// Seat to attach to. `None` observes.
        #[serde(default)]
        player_key: Option<PlayerKey>,
    },

    /// Take a seat in a waiting session.
    Sit {
        /// Session to join.
        session_key: SessionKey,
        /// Key of the new player.
        player_key: PlayerKey,
        /// Display name.
        name: String,
    },

    /// Give up a seat before the game starts.
    Leave {
        /// Session to leave.
        session_key: SessionKey,
        /// Player leaving.
        player_key: PlayerKey,
    },

    /// Seat a robot.
    AddRobot {
        /// Session to add the robot to.
        session_key: SessionKey,
    },

    /// Unseat the robot.
    RemoveRobot {
        /// Session to remove the robot from.
        session_key: SessionKey,
    },

    /// Begin play.
    Start {
        /// Session to start.
        session_key: SessionKey,
    },

    /// Start a follow-on game with the same players.
    AnotherGame {
        /// Finished session.
        session_key: SessionKey,
    },

    /// Subscribe to the session list.
    Monitor,

    /// A game command from a seated player.
    Command {
        /// Target session.
        session_key: SessionKey,
        /// Acting player.
        player_key: PlayerKey,
        /// What to do.
        command: Command,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// Game commands a player can issue.
///
/// Timeouts are not here: they come from the server's clocks only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Place tiles.
    Play {
        /// Tiles and target squares.
        placements: Vec<Placement>,
        /// Words formed.
        #[serde(default)]
        words: Vec<String>,
    },
    /// Exchange tiles with the pool.
    Swap {
        /// Tiles to give back.
        tiles: Vec<Tile>,
    },
    /// Pass the turn.
    Pass,
    /// Take back your last play.
    TakeBack,
    /// Challenge the last play.
    Challenge {
        /// Player who made it.
        challenged: PlayerKey,
    },
    /// Confirm the end of the game.
    ConfirmGameOver,
    /// Reverse the last turn.
    Undo,
    /// Re-apply the last undone turn.
    Redo,
    /// Suspend play.
    Pause,
    /// Resume play.
    Unpause,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A session was created for this client.
    Created {
        /// New session.
        session_key: SessionKey,
    },

    /// A turn was applied.
    Turn {
        /// Session it happened in.
        session_key: SessionKey,
        /// The logged turn.
        turn: Turn,
    },

    /// A turn was undone.
    Undone {
        /// Session it happened in.
        session_key: SessionKey,
        /// The reversed turn.
        turn: Turn,
    },

    /// Who is attached to a session.
    Connections {
        /// Session.
        session_key: SessionKey,
        /// Players with a live channel, robots included.
        connected: Vec<PlayerKey>,
    },

    /// Something about a session changed.
    Update(SessionSummary),

    /// Clock update for the player on the move.
    Tick {
        /// Session.
        session_key: SessionKey,
        /// Owner of the running clock.
        player_key: PlayerKey,
        /// Seconds left.
        remaining: i32,
    },

    /// Play suspended.
    Paused {
        /// Session.
        session_key: SessionKey,
        /// Who paused.
        by: PlayerKey,
    },

    /// Play resumed.
    Unpaused {
        /// Session.
        session_key: SessionKey,
        /// Who resumed.
        by: PlayerKey,
    },

    /// Request failed; sent to the requester only.
    Error(ServerError),

    /// Pong response.
    Pong {
        /// Client timestamp from the ping.
        timestamp: u64,
        /// Server time, milliseconds since the epoch.
        server_time: u64,
    },

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed.
    InvalidInput,
    /// No such session.
    UnknownSession,
    /// No such player in the session.
    UnknownPlayer,
    /// Action refused by the rules of play.
    IllegalAction,
    /// Seat change refused.
    SeatingRefused,
    /// Undo with an empty log.
    NothingToUndo,
    /// Redo with nothing undone.
    NothingToRedo,
    /// Redo could not reproduce the turn.
    ReplayFailed,
    /// Durable storage failed.
    StorageFailed,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<&ManagerError> for ServerError {
    fn from(err: &ManagerError) -> Self {
        let code = match err {
            ManagerError::UnknownSession(_) => ErrorCode::UnknownSession,
            ManagerError::NothingToRedo => ErrorCode::NothingToRedo,
            ManagerError::Store(_) => ErrorCode::StorageFailed,
            ManagerError::Session(SessionError::PlayerNotFound) => ErrorCode::UnknownPlayer,
            ManagerError::Session(_) => ErrorCode::SeatingRefused,
            ManagerError::Engine(engine) => match engine {
                EngineError::Illegal(IllegalAction::NoRobot | IllegalAction::RobotPresent) => {
                    ErrorCode::SeatingRefused
                }
                EngineError::Illegal(_) => ErrorCode::IllegalAction,
                EngineError::UnknownPlayer(_) => ErrorCode::UnknownPlayer,
                EngineError::EmptyLog => ErrorCode::NothingToUndo,
                EngineError::ReplayMismatch(_) => ErrorCode::ReplayFailed,
                EngineError::Inconsistent(_) => ErrorCode::InternalError,
            },
        };
        ServerError::new(code, err.to_string())
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Deserialize from a binary frame holding JSON bytes.
    ///
    /// Tagged enums do not survive bincode, so binary frames stay JSON.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Build the error reply for a failed request.
    pub fn error(err: &ManagerError) -> Self {
        ServerMessage::Error(err.into())
    }
}
