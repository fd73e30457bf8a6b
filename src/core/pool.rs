//! Tile Pool
//!
//! The shared reservoir of undrawn tiles. Tiles are kept as a sorted
//! multiset, so two pools holding the same tiles compare equal no matter
//! which order tiles were drawn and returned in.
//!
//! Where drawn tiles come from is an explicit [`DrawSource`] argument:
//! organic play draws at random, a redo replays the tiles recorded in the
//! original turn.

use std::slice;
use serde::{Serialize, Deserialize};

use super::rng::DeterministicRng;
use super::tile::Tile;

/// English letter distribution: (letter, count, score).
pub const ENGLISH_DISTRIBUTION: [(char, u32, u32); 26] = [
    ('A', 9, 1), ('B', 2, 3), ('C', 2, 3), ('D', 4, 2), ('E', 12, 1),
    ('F', 2, 4), ('G', 3, 2), ('H', 2, 4), ('I', 9, 1), ('J', 1, 8),
    ('K', 1, 5), ('L', 4, 1), ('M', 2, 3), ('N', 6, 1), ('O', 8, 1),
    ('P', 2, 3), ('Q', 1, 10), ('R', 6, 1), ('S', 4, 1), ('T', 6, 1),
    ('U', 4, 1), ('V', 2, 4), ('W', 2, 4), ('X', 1, 8), ('Y', 2, 4),
    ('Z', 1, 10),
];

/// Number of blanks in the English set.
pub const ENGLISH_BLANKS: u32 = 2;

/// Where drawn tiles come from.
#[derive(Debug, Clone)]
pub enum DrawSource<'a> {
    /// Uniformly random draws from the pool's generator.
    Random,
    /// Draw exactly these tiles, in this order.
    Replay(slice::Iter<'a, Tile>),
}

impl<'a> DrawSource<'a> {
    /// Replay previously drawn tiles.
    pub fn replay(tiles: &'a [Tile]) -> Self {
        DrawSource::Replay(tiles.iter())
    }
}

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// A specific tile was requested but the pool does not hold it.
    #[error("Tile {0:?} is not in the pool")]
    MissingTile(Tile),

    /// A replay supplied fewer tiles than the pool could have given.
    #[error("Replay supplied {supplied} tiles, expected {expected}")]
    ShortReplay {
        /// Tiles the draw should have produced.
        expected: usize,
        /// Tiles the replay held.
        supplied: usize,
    },
}

/// Multiset of undrawn tiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TilePool {
    /// Sorted tiles.
    tiles: Vec<Tile>,
    /// Source of randomness for organic draws.
    rng: DeterministicRng,
}

impl PartialEq for TilePool {
    /// Pools are equal when they hold the same tiles.
    fn eq(&self, other: &Self) -> bool {
        self.tiles == other.tiles
    }
}

impl Eq for TilePool {}

impl TilePool {
    /// Create a pool holding the given tiles.
    pub fn new(tiles: impl IntoIterator<Item = Tile>, rng: DeterministicRng) -> Self {
        let mut tiles: Vec<Tile> = tiles.into_iter().map(Tile::to_rack_form).collect();
        tiles.sort_unstable();
        Self { tiles, rng }
    }

    /// Create the standard English set of 100 tiles.
    pub fn standard(rng: DeterministicRng) -> Self {
        let letters = ENGLISH_DISTRIBUTION
            .iter()
            .flat_map(|&(letter, count, score)| (0..count).map(move |_| Tile::new(letter, score)));
        let blanks = (0..ENGLISH_BLANKS).map(|_| Tile::blank());
        Self::new(letters.chain(blanks), rng)
    }

    /// Number of tiles left.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Is the pool empty?
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Number of blanks left.
    pub fn blank_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.blank).count()
    }

    /// Tiles left, sorted.
    pub fn contents(&self) -> &[Tile] {
        &self.tiles
    }

    /// Draw `count` tiles, or as many as are left when the pool runs low.
    ///
    /// A replay must supply exactly that many recorded tiles, all present in
    /// the pool; otherwise nothing is drawn.
    pub fn draw(&mut self, count: usize, source: &mut DrawSource<'_>) -> Result<Vec<Tile>, PoolError> {
        let n = count.min(self.tiles.len());
        match source {
            DrawSource::Random => {
                let mut drawn = Vec::with_capacity(n);
                for _ in 0..n {
                    let idx = self.rng.index(self.tiles.len());
                    drawn.push(self.tiles.remove(idx));
                }
                Ok(drawn)
            }
            DrawSource::Replay(recorded) => {
                let wanted: Vec<Tile> = recorded.by_ref().take(n).copied().collect();
                if wanted.len() < n {
                    return Err(PoolError::ShortReplay { expected: n, supplied: wanted.len() });
                }
                self.remove_tiles(&wanted)?;
                Ok(wanted)
            }
        }
    }

    /// Put tiles back.
    pub fn return_tiles(&mut self, tiles: &[Tile]) {
        for tile in tiles {
            let tile = tile.to_rack_form();
            let idx = self.tiles.partition_point(|t| *t < tile);
            self.tiles.insert(idx, tile);
        }
    }

    /// Take specific tiles out. Nothing is removed unless all are present.
    pub fn remove_tiles(&mut self, tiles: &[Tile]) -> Result<(), PoolError> {
        if let Some(missing) = self.first_missing(tiles) {
            return Err(PoolError::MissingTile(missing));
        }
        for tile in tiles {
            let tile = tile.to_rack_form();
            if let Ok(idx) = self.tiles.binary_search(&tile) {
                self.tiles.remove(idx);
            }
        }
        Ok(())
    }

    fn first_missing(&self, tiles: &[Tile]) -> Option<Tile> {
        let mut wanted: Vec<Tile> = tiles.iter().map(|t| t.to_rack_form()).collect();
        wanted.sort_unstable();
        let mut available = self.tiles.iter();
        for tile in wanted {
            loop {
                match available.next() {
                    Some(t) if *t == tile => break,
                    Some(t) if *t < tile => continue,
                    _ => return Some(tile),
                }
            }
        }
        None
    }
}
