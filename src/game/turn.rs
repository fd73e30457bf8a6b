//! Turn log entries.
//!
//! A Turn is the immutable record of one completed action, carrying
//! everything needed to reverse it. It is not only a player's own move:
//! challenge outcomes and game-end confirmations are also Turns.

use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::hash::{StateHash, StateHasher};
use crate::core::tile::{Placement, Tile};
use crate::game::player::PlayerKey;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Tiles placed on the board.
    Played,
    /// Tiles exchanged with the pool.
    Swapped,
    /// Player passed.
    Passed,
    /// Player's clock ran out.
    TimedOut,
    /// Player took back their own last play.
    TookBack,
    /// Challenge upheld: the challenged play was reversed.
    ChallengeWon,
    /// Challenge failed: the challenger was penalised.
    ChallengeLost,
    /// End-of-game adjustments applied.
    GameEnded,
}

impl TurnKind {
    /// Does this kind consume the actor's turn?
    pub fn consumes_turn(self) -> bool {
        matches!(self, TurnKind::Played | TurnKind::Swapped | TurnKind::Passed | TurnKind::TimedOut)
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndState {
    /// A player emptied their rack with the pool empty.
    GameOver,
    /// Every player passed too many times in a row.
    AllPassed,
    /// A chess clock ran out.
    TimedOut,
}

impl EndState {
    /// End states that finish the game without waiting for a confirmation.
    ///
    /// An emptied rack waits, so the last play can still be challenged.
    pub fn confirms_automatically(self) -> bool {
        !matches!(self, EndState::GameOver)
    }
}

impl fmt::Display for EndState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndState::GameOver => "game over",
            EndState::AllPassed => "all players passed",
            EndState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// One entry in the turn log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// What happened.
    pub kind: TurnKind,
    /// Player primarily affected. For challenges, the player challenged.
    pub player_key: PlayerKey,
    /// Whose turn it is afterwards.
    pub next_to_go: Option<PlayerKey>,
    /// Whose turn it was before this entry was applied.
    pub prior_to_go: Option<PlayerKey>,
    /// When the action was applied.
    pub timestamp: DateTime<Utc>,
    /// Tiles moved between rack and board.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placements: Vec<Placement>,
    /// Tiles handed back to the pool by a swap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub swapped: Vec<Tile>,
    /// Tiles drawn to refill the rack (or, for reversals, returned to the pool).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<Tile>,
    /// Words the player claimed the play forms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<String>,
    /// Who challenged, for challenge outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenger_key: Option<PlayerKey>,
    /// Signed score change for the affected player (the challenger, for a
    /// lost challenge).
    #[serde(default)]
    pub score: i32,
    /// Per-player score changes at game end.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deltas: BTreeMap<PlayerKey, i32>,
    /// Affected player's pass count before this entry.
    #[serde(default)]
    pub passes_before: u32,
    /// Players whose missed turn was consumed by the advance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<PlayerKey>,
    /// The lost challenge flagged the challenger to miss a turn.
    #[serde(default)]
    pub flagged_miss: bool,
    /// Why the game ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_state: Option<EndState>,
}

impl Turn {
    /// Create an entry with an empty payload.
    pub fn new(kind: TurnKind, player_key: PlayerKey, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            player_key,
            next_to_go: None,
            prior_to_go: None,
            timestamp,
            placements: Vec::new(),
            swapped: Vec::new(),
            replacements: Vec::new(),
            words: Vec::new(),
            challenger_key: None,
            score: 0,
            deltas: BTreeMap::new(),
            passes_before: 0,
            skipped: Vec::new(),
            flagged_miss: false,
            end_state: None,
        }
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Turn {:?} {}", self.kind, self.player_key)?;
        if let Some(challenger) = &self.challenger_key {
            write!(f, " by {}", challenger)?;
        }
        if let Some(next) = &self.next_to_go {
            if *next != self.player_key {
                write!(f, " ->{}", next)?;
            }
        }
        if !self.deltas.is_empty() {
            write!(f, " {:?}", self.deltas)?;
        } else if self.score != 0 {
            write!(f, " ({})", self.score)?;
        }
        if !self.placements.is_empty() {
            let placed: Vec<String> = self.placements.iter().map(|p| p.to_string()).collect();
            write!(f, " <={}", placed.join(","))?;
        }
        if !self.replacements.is_empty() {
            let drawn: String = self.replacements.iter().map(|t| t.to_string()).collect();
            write!(f, " => {}", drawn)?;
        }
        if let Some(end) = self.end_state {
            write!(f, " {}", end)?;
        }
        Ok(())
    }
}

/// Digest of a turn log, for checking that two histories agree.
pub fn log_digest(turns: &[Turn]) -> Result<StateHash, bincode::Error> {
    let mut hasher = StateHasher::new(b"CROSSWORD_TURN_LOG_V1");
    hasher.update_u32(turns.len() as u32);
    for turn in turns {
        hasher.update_serialized(turn)?;
    }
    Ok(hasher.finalize())
}
