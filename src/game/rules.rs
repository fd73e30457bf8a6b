//! Rules collaborator.
//!
//! Scoring, challenge adjudication and end-of-game detection live behind
//! the [`Rules`] trait so the turn engine never needs a dictionary.
//! [`StandardRules`] is a playable default.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::tile::{Board, Placement};
use crate::game::clock::TimerMode;
use crate::game::player::{Player, PlayerKey};
use crate::game::session::Session;
use crate::game::turn::{EndState, Turn};

/// Outcome of judging a challenged play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeVerdict {
    /// Every word stands; the challenge fails.
    Valid,
    /// At least one word is rejected; the play is reversed.
    Invalid,
}

/// Penalty for a failed challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    /// No penalty.
    None,
    /// Lose this many points.
    Points(i32),
    /// Miss the next turn.
    Miss,
}

/// Game rules consumed by the turn engine.
///
/// Implementations must be deterministic: redo re-asks the same questions
/// and relies on getting the same answers.
pub trait Rules: Send + Sync {
    /// Score for placing `placements` on `board` (the board as it was
    /// before the tiles went down).
    fn play_score(&self, board: &Board, placements: &[Placement]) -> i32;

    /// Judge the words claimed by a Played turn.
    fn judge_challenge(&self, session: &Session, play: &Turn) -> ChallengeVerdict;

    /// Penalty for `challenger` when their challenge fails.
    fn challenge_penalty(&self, session: &Session, challenger: &Player) -> Penalty;

    /// Has the game reached an ending condition?
    fn game_over(&self, session: &Session) -> Option<EndState>;

    /// Per-player score adjustments when the game ends.
    fn end_game_deltas(&self, session: &Session, end_state: EndState) -> BTreeMap<PlayerKey, i32>;
}

/// Consecutive passes per player that end the game.
pub const PASS_LIMIT: u32 = 2;

/// Bonus for using a whole rack in one play.
pub const FULL_RACK_BONUS: i32 = 50;

/// Default rules: tile-sum scoring and an optional word list.
#[derive(Debug, Clone)]
pub struct StandardRules {
    /// Accepted words, upper case. `None` accepts everything.
    pub words: Option<BTreeSet<String>>,
    /// Penalty for failed challenges.
    pub penalty: Penalty,
    /// Tiles that earn the full-rack bonus.
    pub bonus_tiles: usize,
}

impl Default for StandardRules {
    fn default() -> Self {
        Self {
            words: None,
            penalty: Penalty::Miss,
            bonus_tiles: 7,
        }
    }
}

impl StandardRules {
    /// Accept only the given words.
    pub fn with_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: Some(words.into_iter().map(|w| w.as_ref().to_uppercase()).collect()),
            ..Self::default()
        }
    }

    fn accepts(&self, word: &str) -> bool {
        match &self.words {
            Some(list) => list.contains(&word.to_uppercase()),
            None => true,
        }
    }
}

impl Rules for StandardRules {
    fn play_score(&self, _board: &Board, placements: &[Placement]) -> i32 {
        let sum: i32 = placements.iter().map(|p| p.tile.score as i32).sum();
        if placements.len() >= self.bonus_tiles {
            sum + FULL_RACK_BONUS
        } else {
            sum
        }
    }

    fn judge_challenge(&self, _session: &Session, play: &Turn) -> ChallengeVerdict {
        if play.words.iter().all(|w| self.accepts(w)) {
            ChallengeVerdict::Valid
        } else {
            ChallengeVerdict::Invalid
        }
    }

    fn challenge_penalty(&self, _session: &Session, _challenger: &Player) -> Penalty {
        self.penalty
    }

    fn game_over(&self, session: &Session) -> Option<EndState> {
        if session.players.is_empty() {
            return None;
        }
        if session.pool.is_empty() && session.players.iter().any(|p| p.rack.is_empty()) {
            return Some(EndState::GameOver);
        }
        if session.config.timer == TimerMode::Game
            && session.players.iter().any(|p| p.clock.remaining.is_some_and(|r| r <= 0))
        {
            return Some(EndState::TimedOut);
        }
        if session.players.iter().all(|p| p.passes >= PASS_LIMIT) {
            return Some(EndState::AllPassed);
        }
        None
    }

    /// Each player loses the face value left on their rack; a player who
    /// went out collects everyone else's. On a game clock, every player out
    /// of time also loses `time_penalty` per started minute of overtime.
    fn end_game_deltas(&self, session: &Session, _end_state: EndState) -> BTreeMap<PlayerKey, i32> {
        let mut deltas = BTreeMap::new();
        let mut left_over = 0;
        for p in &session.players {
            let value = p.rack.face_value();
            left_over += value;
            deltas.insert(p.key.clone(), -value);
        }
        let went_out: Vec<&Player> = session.players.iter().filter(|p| p.rack.is_empty()).collect();
        if let [winner] = went_out.as_slice() {
            deltas.insert(winner.key.clone(), left_over);
        }
        if session.config.timer == TimerMode::Game {
            let per_minute = session.config.time_penalty as i32;
            for p in &session.players {
                if let Some(minutes) = p.clock.remaining.and_then(overtime_minutes) {
                    *deltas.entry(p.key.clone()).or_insert(0) -= per_minute * minutes;
                }
            }
        }
        deltas.retain(|_, d| *d != 0);
        deltas
    }
}

/// Started minutes past zero for a clock with `remaining` seconds, or
/// `None` while time is left. Running out exactly counts as one minute.
fn overtime_minutes(remaining: i32) -> Option<i32> {
    if remaining > 0 {
        return None;
    }
    let over = -remaining;
    Some(((over + 59) / 60).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::core::tile::{Square, Tile};
    use crate::game::session::{GameConfig, SessionKey};
    use crate::game::turn::TurnKind;

    fn placements(n: usize) -> Vec<Placement> {
        (0..n)
            .map(|i| Placement::new(Tile::new('A', 1), Square::new(7, i as u8)))
            .collect()
    }

    #[test]
    fn test_play_score_with_full_rack_bonus() {
        let rules = StandardRules::default();
        let board = Board::default();
        assert_eq!(rules.play_score(&board, &placements(3)), 3);
        assert_eq!(rules.play_score(&board, &placements(7)), 57);
    }

    #[test]
    fn test_judge_against_word_list() {
        let rules = StandardRules::with_words(["cat", "dog"]);
        let session = Session::new(SessionKey::from("r"), GameConfig::default());
        let mut play = Turn::new(TurnKind::Played, PlayerKey::new("a"), Utc::now());

        play.words = vec!["CAT".into(), "dog".into()];
        assert_eq!(rules.judge_challenge(&session, &play), ChallengeVerdict::Valid);

        play.words.push("XYZZY".into());
        assert_eq!(rules.judge_challenge(&session, &play), ChallengeVerdict::Invalid);
    }

    #[test]
    fn test_all_passed_ends_game() {
        let rules = StandardRules::default();
        let mut session = Session::new(SessionKey::from("r"), GameConfig::default());
        session.add_player(Player::new("a", "Ann", 7)).unwrap();
        session.add_player(Player::new("b", "Bob", 7)).unwrap();
        assert_eq!(rules.game_over(&session), None);

        session.players[0].passes = 2;
        assert_eq!(rules.game_over(&session), None);
        session.players[1].passes = 2;
        assert_eq!(rules.game_over(&session), Some(EndState::AllPassed));
    }

    #[test]
    fn test_end_game_deltas_reward_going_out() {
        let rules = StandardRules::default();
        let mut session = Session::new(SessionKey::from("r"), GameConfig::default());
        let a = Player::new("a", "Ann", 7);
        let mut b = Player::new("b", "Bob", 7);
        b.rack.add(&[Tile::new('Q', 10), Tile::new('E', 1)]);
        session.players = vec![a, b];

        let deltas = rules.end_game_deltas(&session, EndState::GameOver);
        assert_eq!(deltas.get(&PlayerKey::new("a")), Some(&11));
        assert_eq!(deltas.get(&PlayerKey::new("b")), Some(&-11));
    }

    #[test]
    fn test_game_clock_overtime_costs_points() {
        let rules = StandardRules::default();
        let config = GameConfig { timer: TimerMode::Game, time_limit: 60, time_penalty: 5, ..GameConfig::default() };
        let mut session = Session::new(SessionKey::from("r"), config);
        let mut a = Player::new("a", "Ann", 7);
        let mut b = Player::new("b", "Bob", 7);
        a.rack.add(&[Tile::new('E', 1)]);
        b.rack.add(&[Tile::new('E', 1)]);
        a.clock.remaining = Some(0);
        b.clock.remaining = Some(30);
        session.players = vec![a, b];

        assert_eq!(rules.game_over(&session), Some(EndState::TimedOut));
        let deltas = rules.end_game_deltas(&session, EndState::TimedOut);
        assert_eq!(deltas.get(&PlayerKey::new("a")), Some(&-6));
        assert_eq!(deltas.get(&PlayerKey::new("b")), Some(&-1));

        session.players[0].clock.remaining = Some(-61);
        let deltas = rules.end_game_deltas(&session, EndState::TimedOut);
        assert_eq!(deltas.get(&PlayerKey::new("a")), Some(&-11));
    }

    #[test]
    fn test_overtime_ignored_without_game_clock() {
        let rules = StandardRules::default();
        let mut session = Session::new(SessionKey::from("r"), GameConfig::default());
        let mut a = Player::new("a", "Ann", 7);
        a.clock.remaining = Some(0);
        session.players = vec![a];
        assert!(rules.end_game_deltas(&session, EndState::AllPassed).is_empty());
    }

    #[test]
    fn test_overtime_minutes() {
        assert_eq!(overtime_minutes(1), None);
        assert_eq!(overtime_minutes(0), Some(1));
        assert_eq!(overtime_minutes(-60), Some(1));
        assert_eq!(overtime_minutes(-61), Some(2));
    }
}
