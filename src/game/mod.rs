//! Game Logic Module
//!
//! The per-session state machine. Deterministic apart from the timestamps
//! callers pass in.
//!
//! ## Module Structure
//!
//! - `player`: Players, racks and player keys
//! - `clock`: Turn and game clocks with expiry generations
//! - `turn`: Turn log entries
//! - `session`: Session data model and lifecycle
//! - `rules`: Scoring and adjudication collaborator
//! - `engine`: Action validation and application
//! - `undo`: Undo and deterministic redo

pub mod player;
pub mod clock;
pub mod turn;
pub mod session;
pub mod rules;
pub mod engine;
pub mod undo;

// Re-export key types
pub use player::{Player, PlayerKey, Rack};
pub use clock::{Clock, ClockExpiry, ClockState, TimerMode};
pub use turn::{EndState, Turn, TurnKind, log_digest};
pub use session::{GameConfig, Session, SessionError, SessionKey, SessionState, SessionSummary};
pub use rules::{ChallengeVerdict, Penalty, Rules, StandardRules};
pub use engine::{Action, EngineError, IllegalAction, TurnEngine};
