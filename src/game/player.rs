//! Players and racks.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::tile::{Placement, Tile};
use crate::game::clock::Clock;

/// Player identifier, unique within a session and stable across reconnects.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerKey(pub String);

impl PlayerKey {
    /// Create from anything string-like.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A player's private hand of tiles.
///
/// Racks compare as multisets: the order tiles sit in is presentation only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rack {
    /// Nominal size, fixed at join time.
    pub size: usize,
    tiles: Vec<Tile>,
}

impl PartialEq for Rack {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.sorted() == other.sorted()
    }
}

impl Eq for Rack {}

impl Rack {
    /// Create an empty rack.
    pub fn new(size: usize) -> Self {
        Self { size, tiles: Vec::with_capacity(size) }
    }

    /// Tiles in rack order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Number of tiles held.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Is the rack empty?
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// How many tiles are needed to refill to nominal size.
    pub fn missing(&self) -> usize {
        self.size.saturating_sub(self.tiles.len())
    }

    /// Sum of face values (end-game adjustments).
    pub fn face_value(&self) -> i32 {
        self.tiles.iter().map(|t| t.score as i32).sum()
    }

    /// Tiles in sorted order.
    pub fn sorted(&self) -> Vec<Tile> {
        let mut tiles = self.tiles.clone();
        tiles.sort_unstable();
        tiles
    }

    /// Add tiles at the end.
    pub fn add(&mut self, tiles: &[Tile]) {
        self.tiles.extend(tiles.iter().map(|t| t.to_rack_form()));
    }

    /// Can the rack supply all these tiles (blank placements match blanks)?
    pub fn holds(&self, tiles: &[Tile]) -> bool {
        let mut remaining = self.tiles.clone();
        tiles.iter().all(|wanted| {
            match remaining.iter().position(|t| t.matches(wanted)) {
                Some(idx) => {
                    remaining.remove(idx);
                    true
                }
                None => false,
            }
        })
    }

    /// Remove tiles. Returns the first tile not found, removing nothing.
    pub fn remove(&mut self, tiles: &[Tile]) -> Result<(), Tile> {
        if let Some(missing) = self.first_missing(tiles) {
            return Err(missing);
        }
        for wanted in tiles {
            if let Some(idx) = self.tiles.iter().position(|t| t.matches(wanted)) {
                self.tiles.remove(idx);
            }
        }
        Ok(())
    }

    /// Remove the tiles used by a set of placements.
    pub fn remove_placed(&mut self, placements: &[Placement]) -> Result<(), Tile> {
        let tiles: Vec<Tile> = placements.iter().map(|p| p.tile).collect();
        self.remove(&tiles)
    }

    /// Take every tile off the rack.
    pub fn drain(&mut self) -> Vec<Tile> {
        std::mem::take(&mut self.tiles)
    }

    fn first_missing(&self, tiles: &[Tile]) -> Option<Tile> {
        let mut remaining = self.tiles.clone();
        for wanted in tiles {
            match remaining.iter().position(|t| t.matches(wanted)) {
                Some(idx) => {
                    remaining.remove(idx);
                }
                None => return Some(*wanted),
            }
        }
        None
    }
}

/// A participant in one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Unique key.
    pub key: PlayerKey,
    /// Display name.
    pub name: String,
    /// Is this a robot?
    pub is_robot: bool,
    /// Tiles held.
    pub rack: Rack,
    /// Score (negative after penalties is allowed).
    pub score: i32,
    /// Consecutive passes or swaps since the last play.
    pub passes: u32,
    /// Turn or game clock.
    pub clock: Clock,
    /// Must skip the next turn after a failed challenge.
    #[serde(default)]
    pub miss_next_turn: bool,
    /// Is a channel attached? Not persisted.
    #[serde(skip)]
    pub connected: bool,
}

impl Player {
    /// Create a human player.
    pub fn new(key: impl Into<PlayerKey>, name: impl Into<String>, rack_size: usize) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            is_robot: false,
            rack: Rack::new(rack_size),
            score: 0,
            passes: 0,
            clock: Clock::default(),
            miss_next_turn: false,
            connected: false,
        }
    }

    /// Create a robot player.
    pub fn robot(key: impl Into<PlayerKey>, name: impl Into<String>, rack_size: usize) -> Self {
        Self {
            is_robot: true,
            ..Self::new(key, name, rack_size)
        }
    }

    /// Robots are always reachable.
    pub fn is_connected(&self) -> bool {
        self.is_robot || self.connected
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Player '{}'", self.name)?;
        if self.is_robot {
            write!(f, " (Robot)")?;
        }
        write!(f, " key {}", self.key)
    }
}

impl From<String> for PlayerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
