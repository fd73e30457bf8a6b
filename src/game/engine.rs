//! Turn Engine
//!
//! Validates an action against a session, applies it and appends the
//! resulting [`Turn`]. Every action runs against a copy of the session that
//! replaces the original only on success, so a rejected action leaves state
//! and log untouched.
//!
//! Reversal and replay live in `undo.rs`.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::pool::{DrawSource, PoolError};
use crate::core::tile::{BoardError, Placement, Tile};
use crate::game::player::{Player, PlayerKey};
use crate::game::rules::{ChallengeVerdict, Penalty, Rules};
use crate::game::session::{Session, SessionState};
use crate::game::turn::{EndState, Turn, TurnKind};

// =============================================================================
// ACTIONS
// =============================================================================

/// A player action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Place tiles from the rack.
    Play {
        /// Tiles and target squares.
        placements: Vec<Placement>,
        /// Words the play forms, for challenge adjudication.
        #[serde(default)]
        words: Vec<String>,
    },
    /// Exchange rack tiles with the pool.
    Swap {
        /// Tiles to give back.
        tiles: Vec<Tile>,
    },
    /// Pass the turn.
    Pass,
    /// The player's clock ran out.
    TimeOut,
    /// Take back the actor's own last play.
    TakeBack,
    /// Challenge the last play.
    Challenge {
        /// Player who made the play.
        challenged: PlayerKey,
    },
    /// End the game.
    ConfirmGameOver {
        /// Ending to apply regardless of what the rules report.
        #[serde(default)]
        end_state: Option<EndState>,
    },
}

impl Action {
    /// Rebuild the acting player and action that produced `turn`.
    pub fn from_turn(turn: &Turn) -> Result<(PlayerKey, Action), EngineError> {
        let action = match turn.kind {
            TurnKind::Played => Action::Play {
                placements: turn.placements.clone(),
                words: turn.words.clone(),
            },
            TurnKind::Swapped => Action::Swap { tiles: turn.swapped.clone() },
            TurnKind::Passed => Action::Pass,
            TurnKind::TimedOut => Action::TimeOut,
            TurnKind::TookBack => Action::TakeBack,
            TurnKind::ChallengeWon | TurnKind::ChallengeLost => {
                let challenger = turn
                    .challenger_key
                    .clone()
                    .ok_or_else(|| EngineError::Inconsistent("challenge without challenger".into()))?;
                return Ok((challenger, Action::Challenge { challenged: turn.player_key.clone() }));
            }
            TurnKind::GameEnded => Action::ConfirmGameOver { end_state: turn.end_state },
        };
        Ok((turn.player_key.clone(), action))
    }

    /// Is this one of the actions that hand the turn on?
    pub fn consumes_turn(&self) -> bool {
        matches!(self, Action::Play { .. } | Action::Swap { .. } | Action::Pass | Action::TimeOut)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Reasons an action is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IllegalAction {
    /// Actor is not the player on the move.
    #[error("It is not your turn")]
    NotYourTurn,

    /// Game has not started.
    #[error("Game has not started")]
    NotPlaying,

    /// Game has finished.
    #[error("Game has ended")]
    GameEnded,

    /// Game is paused.
    #[error("Game is paused by {0}")]
    Paused(PlayerKey),

    /// Unpause while not paused.
    #[error("Game is not paused")]
    NotPaused,

    /// No play to challenge.
    #[error("No play by that player to challenge")]
    NothingToChallenge,

    /// No own play to take back.
    #[error("No play of yours to take back")]
    NothingToTakeBack,

    /// Challenging your own play.
    #[error("Cannot challenge your own play")]
    CannotChallengeSelf,

    /// Challenger has no channel attached.
    #[error("Challenger is not connected")]
    ChallengerOffline,

    /// Play or swap with no tiles.
    #[error("No tiles given")]
    NoTiles,

    /// Tiles not on the actor's rack.
    #[error("Tiles are not on your rack")]
    TilesNotOnRack,

    /// Swap larger than the pool.
    #[error("Pool holds {available} tiles, cannot swap {wanted}")]
    PoolTooSmall {
        /// Tiles offered.
        wanted: usize,
        /// Tiles left in the pool.
        available: usize,
    },

    /// Placement conflicts with the board.
    #[error("{0}")]
    Board(BoardError),

    /// Confirmation before the game is over.
    #[error("Game is not over")]
    GameNotOver,

    /// No robot to remove.
    #[error("No robot in this game")]
    NoRobot,

    /// A robot already plays.
    #[error("Game already has a robot")]
    RobotPresent,
}

/// Turn engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Refused by validation.
    #[error("Illegal action: {0}")]
    Illegal(#[from] IllegalAction),

    /// Player key not in the session.
    #[error("Unknown player {0}")]
    UnknownPlayer(PlayerKey),

    /// Undo with no history.
    #[error("Nothing to undo")]
    EmptyLog,

    /// Redo could not reproduce the recorded turn.
    #[error("Replay mismatch: {0}")]
    ReplayMismatch(String),

    /// Log and state disagree.
    #[error("Inconsistent session: {0}")]
    Inconsistent(String),
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        EngineError::ReplayMismatch(err.to_string())
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Live actions are checked against connection state; replays are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Live,
    Replay,
}

/// Applies, reverses and replays turns using a rules collaborator.
#[derive(Clone, Copy)]
pub struct TurnEngine<'r> {
    rules: &'r dyn Rules,
}

impl<'r> TurnEngine<'r> {
    /// Create an engine over `rules`.
    pub fn new(rules: &'r dyn Rules) -> Self {
        Self { rules }
    }

    /// The rules in use.
    pub fn rules(&self) -> &'r dyn Rules {
        self.rules
    }

    /// Apply an action with organic random draws.
    pub fn apply(
        &self,
        session: &mut Session,
        actor: &PlayerKey,
        action: Action,
        at: DateTime<Utc>,
    ) -> Result<Turn, EngineError> {
        self.apply_with(session, actor, action, at, &mut DrawSource::Random)
    }

    /// Apply an action drawing refills from `source`.
    pub fn apply_with(
        &self,
        session: &mut Session,
        actor: &PlayerKey,
        action: Action,
        at: DateTime<Utc>,
        source: &mut DrawSource<'_>,
    ) -> Result<Turn, EngineError> {
        self.execute(session, actor, action, at, source, Mode::Live)
    }

    pub(crate) fn execute(
        &self,
        session: &mut Session,
        actor: &PlayerKey,
        action: Action,
        at: DateTime<Utc>,
        source: &mut DrawSource<'_>,
        mode: Mode,
    ) -> Result<Turn, EngineError> {
        if session.player(actor).is_none() {
            return Err(EngineError::UnknownPlayer(actor.clone()));
        }
        check_state(session, &action)?;

        let mut next = session.clone();
        let mut turn = match action {
            Action::Play { placements, words } => {
                self.play(&mut next, actor, placements, words, at, source)?
            }
            Action::Swap { tiles } => swap(&mut next, actor, tiles, at, source)?,
            Action::Pass => pass(&mut next, actor, TurnKind::Passed, at)?,
            Action::TimeOut => pass(&mut next, actor, TurnKind::TimedOut, at)?,
            Action::TakeBack => take_back(&mut next, actor, at)?,
            Action::Challenge { challenged } => {
                self.challenge(&mut next, actor, challenged, at, mode)?
            }
            Action::ConfirmGameOver { end_state } => {
                self.confirm_game_over(&mut next, actor, end_state, at)?
            }
        };

        turn.prior_to_go = session.whose_turn.clone();
        turn.next_to_go = next.whose_turn.clone();
        next.turns.push(turn.clone());
        next.last_activity = at;
        *session = next;
        Ok(turn)
    }

    fn play(
        &self,
        s: &mut Session,
        actor: &PlayerKey,
        placements: Vec<Placement>,
        words: Vec<String>,
        at: DateTime<Utc>,
        source: &mut DrawSource<'_>,
    ) -> Result<Turn, EngineError> {
        require_turn(s, actor)?;
        if placements.is_empty() {
            return Err(IllegalAction::NoTiles.into());
        }
        let tiles: Vec<Tile> = placements.iter().map(|p| p.tile).collect();
        if !player(s, actor)?.rack.holds(&tiles) {
            return Err(IllegalAction::TilesNotOnRack.into());
        }
        s.board.check_free(&placements).map_err(IllegalAction::Board)?;

        let score = self.rules.play_score(&s.board, &placements);
        s.board.place(&placements).map_err(IllegalAction::Board)?;

        let p = player_mut(s, actor)?;
        p.rack
            .remove_placed(&placements)
            .map_err(|_| IllegalAction::TilesNotOnRack)?;
        let missing = p.rack.missing();

        let replacements = s.pool.draw(missing, source)?;

        let p = player_mut(s, actor)?;
        p.rack.add(&replacements);
        let passes_before = p.passes;
        p.passes = 0;
        p.score += score;

        let mut turn = Turn::new(TurnKind::Played, actor.clone(), at);
        turn.placements = placements;
        turn.words = words;
        turn.replacements = replacements;
        turn.score = score;
        turn.passes_before = passes_before;
        advance(s, actor, &mut turn);
        Ok(turn)
    }

    fn challenge(
        &self,
        s: &mut Session,
        challenger: &PlayerKey,
        challenged: PlayerKey,
        at: DateTime<Utc>,
        mode: Mode,
    ) -> Result<Turn, EngineError> {
        if *challenger == challenged {
            return Err(IllegalAction::CannotChallengeSelf.into());
        }
        if s.player(&challenged).is_none() {
            return Err(EngineError::UnknownPlayer(challenged));
        }
        if mode == Mode::Live && !player(s, challenger)?.is_connected() {
            return Err(IllegalAction::ChallengerOffline.into());
        }
        let play = last_play(s)
            .filter(|t| t.player_key == challenged)
            .cloned()
            .ok_or(IllegalAction::NothingToChallenge)?;

        match self.rules.judge_challenge(s, &play) {
            ChallengeVerdict::Invalid => {
                let mut turn = Turn::new(TurnKind::ChallengeWon, challenged.clone(), at);
                turn.challenger_key = Some(challenger.clone());
                reverse_play(s, &play, &mut turn)?;
                advance(s, &challenged, &mut turn);
                Ok(turn)
            }
            ChallengeVerdict::Valid => {
                let mut turn = Turn::new(TurnKind::ChallengeLost, challenged, at);
                turn.challenger_key = Some(challenger.clone());
                let penalty = self.rules.challenge_penalty(s, player(s, challenger)?);
                let p = player_mut(s, challenger)?;
                match penalty {
                    Penalty::None => {}
                    Penalty::Points(points) => {
                        p.score -= points;
                        turn.score = -points;
                    }
                    Penalty::Miss => {
                        if !p.miss_next_turn {
                            p.miss_next_turn = true;
                            turn.flagged_miss = true;
                        }
                    }
                }
                Ok(turn)
            }
        }
    }

    fn confirm_game_over(
        &self,
        s: &mut Session,
        actor: &PlayerKey,
        end_state: Option<EndState>,
        at: DateTime<Utc>,
    ) -> Result<Turn, EngineError> {
        let end = match end_state {
            Some(end) => end,
            None => self.rules.game_over(s).ok_or(IllegalAction::GameNotOver)?,
        };
        let deltas = self.rules.end_game_deltas(s, end);
        for (key, delta) in &deltas {
            if let Some(p) = s.player_mut(key) {
                p.score += delta;
            }
        }

        s.state = SessionState::GameOver;
        s.whose_turn = None;
        s.end_state = Some(end);

        let mut turn = Turn::new(TurnKind::GameEnded, actor.clone(), at);
        turn.deltas = deltas;
        turn.end_state = Some(end);
        Ok(turn)
    }
}

// =============================================================================
// ACTION HELPERS
// =============================================================================

fn check_state(session: &Session, action: &Action) -> Result<(), IllegalAction> {
    match session.state {
        SessionState::Waiting => Err(IllegalAction::NotPlaying),
        SessionState::GameOver => Err(IllegalAction::GameEnded),
        SessionState::Playing => match &session.paused_by {
            Some(by) if !matches!(action, Action::ConfirmGameOver { .. }) => {
                Err(IllegalAction::Paused(by.clone()))
            }
            _ => Ok(()),
        },
    }
}

fn require_turn(session: &Session, actor: &PlayerKey) -> Result<(), IllegalAction> {
    if session.whose_turn.as_ref() == Some(actor) {
        Ok(())
    } else {
        Err(IllegalAction::NotYourTurn)
    }
}

fn player<'s>(session: &'s Session, key: &PlayerKey) -> Result<&'s Player, EngineError> {
    session
        .player(key)
        .ok_or_else(|| EngineError::UnknownPlayer(key.clone()))
}

pub(crate) fn player_mut<'s>(session: &'s mut Session, key: &PlayerKey) -> Result<&'s mut Player, EngineError> {
    session
        .player_mut(key)
        .ok_or_else(|| EngineError::UnknownPlayer(key.clone()))
}

/// Most recent play that a takeback or challenge can target. Lost
/// challenges in between do not shield it.
fn last_play(session: &Session) -> Option<&Turn> {
    session
        .turns
        .iter()
        .rev()
        .find(|t| t.kind != TurnKind::ChallengeLost)
        .filter(|t| t.kind == TurnKind::Played)
}

fn swap(
    s: &mut Session,
    actor: &PlayerKey,
    tiles: Vec<Tile>,
    at: DateTime<Utc>,
    source: &mut DrawSource<'_>,
) -> Result<Turn, EngineError> {
    require_turn(s, actor)?;
    if tiles.is_empty() {
        return Err(IllegalAction::NoTiles.into());
    }
    let tiles: Vec<Tile> = tiles.into_iter().map(Tile::to_rack_form).collect();
    if !player(s, actor)?.rack.holds(&tiles) {
        return Err(IllegalAction::TilesNotOnRack.into());
    }
    if s.pool.len() < tiles.len() {
        return Err(IllegalAction::PoolTooSmall {
            wanted: tiles.len(),
            available: s.pool.len(),
        }
        .into());
    }

    player_mut(s, actor)?
        .rack
        .remove(&tiles)
        .map_err(|_| IllegalAction::TilesNotOnRack)?;
    // Draw before returning so a swap never gets its own tiles back
    let replacements = s.pool.draw(tiles.len(), source)?;
    s.pool.return_tiles(&tiles);

    let p = player_mut(s, actor)?;
    p.rack.add(&replacements);
    let passes_before = p.passes;
    p.passes += 1;

    let mut turn = Turn::new(TurnKind::Swapped, actor.clone(), at);
    turn.swapped = tiles;
    turn.replacements = replacements;
    turn.passes_before = passes_before;
    advance(s, actor, &mut turn);
    Ok(turn)
}

fn pass(s: &mut Session, actor: &PlayerKey, kind: TurnKind, at: DateTime<Utc>) -> Result<Turn, EngineError> {
    require_turn(s, actor)?;
    let p = player_mut(s, actor)?;
    let passes_before = p.passes;
    p.passes += 1;

    let mut turn = Turn::new(kind, actor.clone(), at);
    turn.passes_before = passes_before;
    advance(s, actor, &mut turn);
    Ok(turn)
}

fn take_back(s: &mut Session, actor: &PlayerKey, at: DateTime<Utc>) -> Result<Turn, EngineError> {
    let play = last_play(s)
        .filter(|t| &t.player_key == actor)
        .cloned()
        .ok_or(IllegalAction::NothingToTakeBack)?;

    let mut turn = Turn::new(TurnKind::TookBack, actor.clone(), at);
    reverse_play(s, &play, &mut turn)?;
    s.whose_turn = Some(actor.clone());
    Ok(turn)
}

/// Lift a play off the board: placed tiles back to the rack, the refill
/// back to the pool, score and passes as they were before it.
fn reverse_play(s: &mut Session, play: &Turn, turn: &mut Turn) -> Result<(), EngineError> {
    let lifted = s
        .board
        .lift(&play.placements)
        .map_err(|e| EngineError::Inconsistent(e.to_string()))?;

    let p = player_mut(s, &play.player_key)?;
    p.rack
        .remove(&play.replacements)
        .map_err(|t| EngineError::Inconsistent(format!("{} is not on the rack of {}", t, play.player_key)))?;
    p.rack.add(&lifted);
    turn.passes_before = p.passes;
    p.passes = play.passes_before;
    p.score -= play.score;

    s.pool.return_tiles(&play.replacements);

    turn.placements = play.placements.clone();
    turn.replacements = play.replacements.clone();
    turn.score = -play.score;
    Ok(())
}

/// Hand the turn to the next player after `from`, consuming missed turns.
fn advance(s: &mut Session, from: &PlayerKey, turn: &mut Turn) {
    let order: Vec<PlayerKey> = s.players_after(from).map(|p| p.key.clone()).collect();
    // A second lap finds everyone's flag cleared
    for key in order.iter().chain(order.iter()) {
        let Some(p) = s.player_mut(key) else { continue };
        if p.miss_next_turn {
            p.miss_next_turn = false;
            turn.skipped.push(key.clone());
            continue;
        }
        s.whose_turn = Some(key.clone());
        return;
    }
}

// =============================================================================
// TESTS
// =============================================================================
