//! Game Session
//!
//! One running game: its players, pool, board and turn log. The session is
//! plain data; the turn engine drives it and the session manager owns it.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::hash::{StateHash, StateHasher, compute_state_hash};
use crate::core::pool::{DrawSource, TilePool};
use crate::core::rng::DeterministicRng;
use crate::core::tile::{Board, Tile, DEFAULT_BOARD_SIZE};
use crate::game::clock::{ClockExpiry, TimerMode};
use crate::game::player::{Player, PlayerKey};
use crate::game::turn::{EndState, Turn};

// =============================================================================
// SESSION KEY
// =============================================================================

/// Unique session identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub String);

impl SessionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// CONFIG AND STATE
// =============================================================================

/// Per-session game options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Tiles per rack.
    pub rack_size: usize,
    /// Players needed to start.
    pub min_players: usize,
    /// Seats available.
    pub max_players: usize,
    /// Clock policy.
    pub timer: TimerMode,
    /// Seconds per turn (`Turn`) or per game (`Game`).
    pub time_limit: u32,
    /// Points lost per started minute of overtime on a game clock.
    #[serde(default = "default_time_penalty")]
    pub time_penalty: u32,
    /// Board edge length.
    pub board_size: u8,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            rack_size: 7,
            min_players: 2,
            max_players: 4,
            timer: TimerMode::None,
            time_limit: 0,
            time_penalty: default_time_penalty(),
            board_size: DEFAULT_BOARD_SIZE,
        }
    }
}

fn default_time_penalty() -> u32 {
    5
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Gathering players.
    Waiting,
    /// Game in progress.
    Playing,
    /// Game finished. Only undo and re-confirmation remain legal.
    GameOver,
}

impl SessionState {
    fn tag(self) -> u8 {
        match self {
            SessionState::Waiting => 0,
            SessionState::Playing => 1,
            SessionState::GameOver => 2,
        }
    }
}

/// Lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Every seat is taken.
    #[error("Session is full")]
    SessionFull,

    /// Player key already seated.
    #[error("Already in session")]
    AlreadyInSession,

    /// Seats only change before the first turn.
    #[error("Game in progress")]
    GameInProgress,

    /// The game has finished.
    #[error("Game is over")]
    GameOver,

    /// Fewer than `min_players` seated.
    #[error("Not enough players")]
    NotEnoughPlayers,

    /// Player not found.
    #[error("Player not found")]
    PlayerNotFound,
}

/// Session-list entry sent to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session key.
    pub key: SessionKey,
    /// Lifecycle state.
    pub state: SessionState,
    /// Seated players in turn order.
    pub players: Vec<PlayerKey>,
    /// Whose turn it is.
    pub whose_turn: Option<PlayerKey>,
    /// Log length.
    pub turns: usize,
    /// Last applied action.
    pub last_activity: DateTime<Utc>,
    /// Follow-on game, once one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_session_key: Option<SessionKey>,
}

// =============================================================================
// SESSION
// =============================================================================

/// A game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique key.
    pub key: SessionKey,
    /// Options fixed at creation.
    pub config: GameConfig,
    /// Players in turn order.
    pub players: Vec<Player>,
    /// Undrawn tiles.
    pub pool: TilePool,
    /// Placed tiles.
    pub board: Board,
    /// Lifecycle state.
    pub state: SessionState,
    /// Player on the move. Always a seated player while Playing.
    pub whose_turn: Option<PlayerKey>,
    /// Append-only log; only undo pops it.
    pub turns: Vec<Turn>,
    /// When the last action was applied.
    pub last_activity: DateTime<Utc>,
    /// Follow-on game with the same players.
    #[serde(default)]
    pub next_session_key: Option<SessionKey>,
    /// Player who paused the game, if paused.
    #[serde(default)]
    pub paused_by: Option<PlayerKey>,
    /// Why the game ended.
    #[serde(default)]
    pub end_state: Option<EndState>,
}

impl Session {
    /// Create a waiting session with a full standard pool.
    pub fn new(key: SessionKey, config: GameConfig) -> Self {
        let pool = TilePool::standard(DeterministicRng::for_session(key.as_str(), 0));
        let board = Board::new(config.board_size);
        Self {
            key,
            config,
            players: Vec::new(),
            pool,
            board,
            state: SessionState::Waiting,
            whose_turn: None,
            turns: Vec::new(),
            last_activity: Utc::now(),
            next_session_key: None,
            paused_by: None,
            end_state: None,
        }
    }

    /// Seat a player and deal them a full rack.
    pub fn add_player(&mut self, mut player: Player) -> Result<(), SessionError> {
        if self.state != SessionState::Waiting {
            return Err(SessionError::GameInProgress);
        }
        if self.players.len() >= self.config.max_players {
            return Err(SessionError::SessionFull);
        }
        if self.player(&player.key).is_some() {
            return Err(SessionError::AlreadyInSession);
        }

        // Random draws never fail
        if let Ok(tiles) = self.pool.draw(player.rack.missing(), &mut DrawSource::Random) {
            player.rack.add(&tiles);
        }
        self.players.push(player);
        Ok(())
    }

    /// Unseat a player, returning their rack to the pool.
    pub fn remove_player(&mut self, key: &PlayerKey) -> Result<Player, SessionError> {
        if self.state != SessionState::Waiting {
            return Err(SessionError::GameInProgress);
        }
        let idx = self
            .players
            .iter()
            .position(|p| &p.key == key)
            .ok_or(SessionError::PlayerNotFound)?;

        let mut player = self.players.remove(idx);
        let tiles = player.rack.drain();
        self.pool.return_tiles(&tiles);
        Ok(player)
    }

    /// Begin play. The first player to join moves first.
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Waiting => {}
            SessionState::Playing => return Err(SessionError::GameInProgress),
            SessionState::GameOver => return Err(SessionError::GameOver),
        }
        if self.players.len() < self.config.min_players {
            return Err(SessionError::NotEnoughPlayers);
        }
        self.state = SessionState::Playing;
        self.whose_turn = self.players.first().map(|p| p.key.clone());
        Ok(())
    }

    /// Look up a player.
    pub fn player(&self, key: &PlayerKey) -> Option<&Player> {
        self.players.iter().find(|p| &p.key == key)
    }

    /// Look up a player mutably.
    pub fn player_mut(&mut self, key: &PlayerKey) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| &p.key == key)
    }

    /// Does a robot sit at this table?
    pub fn has_robot(&self) -> bool {
        self.players.iter().any(|p| p.is_robot)
    }

    /// Players in turn order starting after `key`, wrapping around and
    /// ending with `key` itself.
    pub fn players_after<'a>(&'a self, key: &PlayerKey) -> impl Iterator<Item = &'a Player> + 'a {
        let start = self
            .players
            .iter()
            .position(|p| &p.key == key)
            .map(|i| i + 1)
            .unwrap_or(0);
        let n = self.players.len();
        (0..n).map(move |offset| &self.players[(start + offset) % n])
    }

    /// Tiles in play: pool, racks and board. Constant for a session.
    pub fn tile_count(&self) -> usize {
        self.pool.len()
            + self.players.iter().map(|p| p.rack.len()).sum::<usize>()
            + self.board.tile_count()
    }

    /// Is play suspended?
    pub fn is_paused(&self) -> bool {
        self.paused_by.is_some()
    }

    /// Monitor-facing summary.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            state: self.state,
            players: self.players.iter().map(|p| p.key.clone()).collect(),
            whose_turn: self.whose_turn.clone(),
            turns: self.turns.len(),
            last_activity: self.last_activity,
            next_session_key: self.next_session_key.clone(),
        }
    }

    // =========================================================================
    // CLOCKS
    // =========================================================================

    /// Arm the clock of the player on the move and stop everyone else's.
    ///
    /// Returns the armed player and clock generation.
    pub fn arm_clocks(&mut self) -> Option<(PlayerKey, u64)> {
        let timer = self.config.timer;
        let limit = self.config.time_limit;
        if timer == TimerMode::None || self.state != SessionState::Playing || self.is_paused() {
            for p in &mut self.players {
                p.clock.stop();
            }
            return None;
        }

        let mover = self.whose_turn.clone()?;
        let mut armed = None;
        for p in &mut self.players {
            if p.key != mover {
                // A turn allowance never carries over to the player's next turn
                if timer == TimerMode::Turn && p.clock.remaining.is_some() {
                    p.clock.reset();
                } else if p.clock.is_running() {
                    p.clock.stop();
                }
                continue;
            }
            let generation = match (timer, p.clock.remaining) {
                (TimerMode::Game, Some(_)) => p.clock.resume(),
                _ => p.clock.start(limit),
            };
            armed = Some((p.key.clone(), generation));
        }
        armed
    }

    /// Restart clocks after a pause. A turn clock carries on from where it
    /// stopped instead of granting a fresh allowance.
    pub fn resume_clocks(&mut self) -> Option<(PlayerKey, u64)> {
        if self.config.timer == TimerMode::Turn && self.state == SessionState::Playing && !self.is_paused() {
            let mover = self.whose_turn.clone()?;
            let clock = &mut self.player_mut(&mover)?.clock;
            if clock.remaining.is_some_and(|r| r > 0) {
                let generation = clock.resume();
                return Some((mover, generation));
            }
        }
        self.arm_clocks()
    }

    /// Advance every running clock by one second, collecting expiries.
    pub fn tick_clocks(&mut self) -> Vec<(PlayerKey, ClockExpiry)> {
        self.players
            .iter_mut()
            .filter_map(|p| p.clock.tick().map(|e| (p.key.clone(), e)))
            .collect()
    }

    // =========================================================================
    // HASHING
    // =========================================================================

    /// Hash the game-relevant state.
    ///
    /// Covers players, pool, board, turn owner and lifecycle. Connection
    /// flags, clocks and activity timestamps are left out.
    pub fn state_hash(&self) -> StateHash {
        compute_state_hash(self.turns.len() as u32, |h| {
            h.update_u8(self.state.tag());
            h.update_str(self.whose_turn.as_ref().map(|k| k.as_str()).unwrap_or(""));

            h.update_u32(self.players.len() as u32);
            for p in &self.players {
                h.update_str(p.key.as_str());
                h.update_i32(p.score);
                h.update_u32(p.passes);
                h.update_bool(p.miss_next_turn);
                hash_tiles(h, &p.rack.sorted());
            }

            hash_tiles(h, self.pool.contents());

            h.update_u32(self.board.tile_count() as u32);
            for (square, tile) in self.board.iter() {
                h.update_u8(square.row);
                h.update_u8(square.col);
                hash_tile(h, tile);
            }
        })
    }
}

fn hash_tile(h: &mut StateHasher, tile: &Tile) {
    h.update_u32(tile.letter as u32);
    h.update_u32(tile.score);
    h.update_bool(tile.blank);
}

fn hash_tiles(h: &mut StateHasher, tiles: &[Tile]) {
    h.update_u32(tiles.len() as u32);
    for tile in tiles {
        hash_tile(h, tile);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn two_player_session() -> Session {
        let mut session = Session::new(SessionKey::from("test"), GameConfig::default());
        session.add_player(Player::new("a", "Ann", 7)).unwrap();
        session.add_player(Player::new("b", "Bob", 7)).unwrap();
        session
    }

    #[test]
    fn test_add_player_deals_full_rack() {
        let session = two_player_session();
        assert_eq!(session.players.len(), 2);
        assert!(session.players.iter().all(|p| p.rack.len() == 7));
        assert_eq!(session.pool.len(), 86);
        assert_eq!(session.tile_count(), 100);
    }

    #[test]
    fn test_add_player_rejects_duplicate_and_full() {
        let mut session = two_player_session();
        assert_eq!(
            session.add_player(Player::new("a", "Again", 7)),
            Err(SessionError::AlreadyInSession)
        );

        session.config.max_players = 2;
        assert_eq!(
            session.add_player(Player::new("c", "Cat", 7)),
            Err(SessionError::SessionFull)
        );
        assert_eq!(session.tile_count(), 100);
    }

    #[test]
    fn test_remove_player_returns_rack() {
        let mut session = two_player_session();
        let removed = session.remove_player(&PlayerKey::new("a")).unwrap();
        assert_eq!(removed.key, PlayerKey::new("a"));
        assert_eq!(session.pool.len(), 93);
        assert_eq!(session.tile_count(), 100);
    }

    #[test]
    fn test_start_gives_first_player_the_turn() {
        let mut session = Session::new(SessionKey::from("solo"), GameConfig::default());
        session.add_player(Player::new("a", "Ann", 7)).unwrap();
        assert_eq!(session.start(), Err(SessionError::NotEnoughPlayers));

        session.add_player(Player::new("b", "Bob", 7)).unwrap();
        session.start().unwrap();
        assert_eq!(session.state, SessionState::Playing);
        assert_eq!(session.whose_turn, Some(PlayerKey::new("a")));
        assert_eq!(
            session.add_player(Player::new("c", "Cat", 7)),
            Err(SessionError::GameInProgress)
        );
    }

    #[test]
    fn test_players_after_wraps() {
        let mut session = two_player_session();
        session.add_player(Player::new("c", "Cat", 7)).unwrap();
        let order: Vec<&str> = session
            .players_after(&PlayerKey::new("b"))
            .map(|p| p.key.as_str())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_same_key_deals_same_racks() {
        let a = two_player_session();
        let b = two_player_session();
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_state_hash_ignores_connection_and_rack_order() {
        let mut session = two_player_session();
        let before = session.state_hash();

        session.players[0].connected = true;
        let mut tiles = session.players[0].rack.drain();
        tiles.reverse();
        session.players[0].rack.add(&tiles);
        assert_eq!(session.state_hash(), before);

        session.players[0].score = 5;
        assert_ne!(session.state_hash(), before);
    }

    #[test]
    fn test_turn_clock_follows_mover() {
        let mut session = two_player_session();
        session.config.timer = TimerMode::Turn;
        session.config.time_limit = 30;
        session.start().unwrap();

        let (key, _) = session.arm_clocks().unwrap();
        assert_eq!(key, PlayerKey::new("a"));
        assert!(session.players[0].clock.is_running());
        assert!(!session.players[1].clock.is_running());

        session.whose_turn = Some(PlayerKey::new("b"));
        session.arm_clocks();
        assert!(!session.players[0].clock.is_running());
        assert_eq!(session.players[0].clock.remaining, None);
        assert!(session.players[1].clock.is_running());
        assert_eq!(session.players[1].clock.remaining, Some(30));
    }

    #[test]
    fn test_game_clock_keeps_remaining_time() {
        let mut session = two_player_session();
        session.config.timer = TimerMode::Game;
        session.config.time_limit = 100;
        session.start().unwrap();

        session.arm_clocks();
        for _ in 0..10 {
            assert!(session.tick_clocks().is_empty());
        }
        session.whose_turn = Some(PlayerKey::new("b"));
        session.arm_clocks();
        session.whose_turn = Some(PlayerKey::new("a"));
        session.arm_clocks();
        assert_eq!(session.players[0].clock.remaining, Some(90));
        assert_eq!(session.players[1].clock.remaining, Some(100));
    }

    #[test]
    fn test_pause_holds_turn_clock() {
        let mut session = two_player_session();
        session.config.timer = TimerMode::Turn;
        session.config.time_limit = 30;
        session.start().unwrap();
        session.arm_clocks();
        for _ in 0..5 {
            session.tick_clocks();
        }

        session.paused_by = Some(PlayerKey::new("b"));
        session.arm_clocks();
        assert!(!session.players[0].clock.is_running());
        assert!(session.tick_clocks().is_empty());

        session.paused_by = None;
        session.resume_clocks();
        assert!(session.players[0].clock.is_running());
        assert_eq!(session.players[0].clock.remaining, Some(25));
    }

    #[test]
    fn test_no_timer_arms_nothing() {
        let mut session = two_player_session();
        session.start().unwrap();
        assert!(session.arm_clocks().is_none());
        assert!(session.tick_clocks().is_empty());
    }
}
