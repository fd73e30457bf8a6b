//! Undo and redo over the turn log.
//!
//! Undo is pure state restoration: it pops the tail Turn and inverts it
//! from the data the Turn recorded, without asking the rules anything and
//! without drawing. Redo rebuilds the original action from the Turn and
//! drives it through the engine again, drawing the recorded replacements
//! instead of random tiles.

use crate::core::pool::DrawSource;
use crate::game::engine::{player_mut, Action, EngineError, Mode, TurnEngine};
use crate::game::session::{Session, SessionState};
use crate::game::turn::{Turn, TurnKind};

impl TurnEngine<'_> {
    /// Reverse the most recent turn, returning it.
    pub fn undo(&self, session: &mut Session) -> Result<Turn, EngineError> {
        let mut next = session.clone();
        let turn = next.turns.pop().ok_or(EngineError::EmptyLog)?;

        match turn.kind {
            TurnKind::Played => unplay(&mut next, &turn)?,
            TurnKind::Swapped => unswap(&mut next, &turn)?,
            TurnKind::Passed | TurnKind::TimedOut => {
                player_mut(&mut next, &turn.player_key)?.passes = turn.passes_before;
            }
            TurnKind::TookBack | TurnKind::ChallengeWon => replay_reversed(&mut next, &turn)?,
            TurnKind::ChallengeLost => {
                let challenger = turn
                    .challenger_key
                    .as_ref()
                    .ok_or_else(|| EngineError::Inconsistent("challenge without challenger".into()))?;
                let p = player_mut(&mut next, challenger)?;
                p.score -= turn.score;
                if turn.flagged_miss {
                    p.miss_next_turn = false;
                }
            }
            TurnKind::GameEnded => {
                for (key, delta) in &turn.deltas {
                    if let Some(p) = next.player_mut(key) {
                        p.score -= delta;
                    }
                }
            }
        }

        for key in &turn.skipped {
            player_mut(&mut next, key)?.miss_next_turn = true;
        }
        next.whose_turn = turn.prior_to_go.clone();
        next.state = SessionState::Playing;
        next.end_state = None;

        *session = next;
        Ok(turn)
    }

    /// Re-apply a turn popped by [`undo`](Self::undo).
    ///
    /// The result equals `turn`, and the session ends up as it was right
    /// after `turn` was first applied. Nothing changes on failure.
    pub fn redo(&self, session: &mut Session, turn: &Turn) -> Result<Turn, EngineError> {
        let (actor, action) = Action::from_turn(turn)?;
        let mut source = DrawSource::replay(&turn.replacements);

        let mut next = session.clone();
        let redone = self.execute(&mut next, &actor, action, turn.timestamp, &mut source, Mode::Replay)?;
        if redone != *turn {
            return Err(EngineError::ReplayMismatch(format!("redo produced {}, expected {}", redone, turn)));
        }
        *session = next;
        Ok(redone)
    }
}

/// Lift placed tiles back onto the rack and the refill back into the pool.
fn unplay(s: &mut Session, turn: &Turn) -> Result<(), EngineError> {
    let lifted = s
        .board
        .lift(&turn.placements)
        .map_err(|e| EngineError::Inconsistent(e.to_string()))?;
    let p = player_mut(s, &turn.player_key)?;
    p.rack
        .remove(&turn.replacements)
        .map_err(|t| EngineError::Inconsistent(format!("{} is not on the rack", t)))?;
    p.rack.add(&lifted);
    p.score -= turn.score;
    p.passes = turn.passes_before;
    s.pool.return_tiles(&turn.replacements);
    Ok(())
}

fn unswap(s: &mut Session, turn: &Turn) -> Result<(), EngineError> {
    s.pool
        .remove_tiles(&turn.swapped)
        .map_err(|e| EngineError::Inconsistent(e.to_string()))?;
    let p = player_mut(s, &turn.player_key)?;
    p.rack
        .remove(&turn.replacements)
        .map_err(|t| EngineError::Inconsistent(format!("{} is not on the rack", t)))?;
    p.rack.add(&turn.swapped);
    p.passes = turn.passes_before;
    s.pool.return_tiles(&turn.replacements);
    Ok(())
}

/// Put a reversed play back: tiles onto the board, the refill back on the
/// rack, score restored.
fn replay_reversed(s: &mut Session, turn: &Turn) -> Result<(), EngineError> {
    s.pool
        .remove_tiles(&turn.replacements)
        .map_err(|e| EngineError::Inconsistent(e.to_string()))?;
    let p = player_mut(s, &turn.player_key)?;
    p.rack
        .remove_placed(&turn.placements)
        .map_err(|t| EngineError::Inconsistent(format!("{} is not on the rack", t)))?;
    p.rack.add(&turn.replacements);
    p.score -= turn.score;
    p.passes = turn.passes_before;
    s.board
        .place(&turn.placements)
        .map_err(|e| EngineError::Inconsistent(e.to_string()))?;
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
