//! Tiles, squares and the board.
//!
//! The board is opaque to the turn engine apart from tile conservation:
//! it only records which tile sits on which square.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};

/// Letter carried by a blank tile that has not been placed.
pub const BLANK: char = ' ';

/// Default board edge length.
pub const DEFAULT_BOARD_SIZE: u8 = 15;

/// A single letter tile.
///
/// Ordered so that pools and racks can be kept as canonical multisets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Letter shown on the tile (`BLANK` for an unplaced blank).
    pub letter: char,
    /// Face value in points.
    pub score: u32,
    /// Is this a blank tile?
    pub blank: bool,
}

impl Tile {
    /// Create a lettered tile.
    pub const fn new(letter: char, score: u32) -> Self {
        Self { letter, score, blank: false }
    }

    /// Create an unplaced blank.
    pub const fn blank() -> Self {
        Self { letter: BLANK, score: 0, blank: true }
    }

    /// Assign a letter to a blank for placement. Lettered tiles are unchanged.
    pub fn with_letter(self, letter: char) -> Self {
        if self.blank {
            Self { letter, ..self }
        } else {
            self
        }
    }

    /// The form this tile takes on a rack or in the pool.
    ///
    /// Blanks lose whatever letter they were assigned on the board.
    pub fn to_rack_form(self) -> Self {
        if self.blank {
            Self::blank()
        } else {
            self
        }
    }

    /// Does a rack tile satisfy a placed tile?
    ///
    /// A placed blank may carry any letter but must keep the blank's score.
    pub fn matches(&self, placed: &Tile) -> bool {
        *self == placed.to_rack_form() && self.score == placed.score
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blank {
            if self.letter == BLANK {
                write!(f, "_")
            } else {
                write!(f, "{}", self.letter.to_ascii_lowercase())
            }
        } else {
            write!(f, "{}", self.letter)
        }
    }
}

/// A board coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Square {
    /// Row index from the top.
    pub row: u8,
    /// Column index from the left.
    pub col: u8,
}

impl Square {
    /// Create a square.
    pub const fn new(row: u8, col: u8) -> Self {
        Self { row, col }
    }
}

/// A tile moved between a rack and a board square.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// The tile as it appears on the board.
    pub tile: Tile,
    /// Where it goes.
    pub square: Square,
}

impl Placement {
    /// Create a placement.
    pub const fn new(tile: Tile, square: Square) -> Self {
        Self { tile, square }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{},{}", self.tile, self.square.row, self.square.col)
    }
}

/// Board errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    /// Square lies outside the board.
    #[error("Square {0:?} is off the board")]
    OffBoard(Square),

    /// Square already holds a tile.
    #[error("Square {0:?} is occupied")]
    Occupied(Square),

    /// Square holds no tile to lift.
    #[error("Square {0:?} is empty")]
    Empty(Square),
}

/// Tiles placed on the board.
///
/// Serialized as a list of placements, since square keys are not strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BoardRepr", into = "BoardRepr")]
pub struct Board {
    /// Edge length.
    pub size: u8,
    /// Occupied squares.
    squares: BTreeMap<Square, Tile>,
}

#[derive(Serialize, Deserialize)]
struct BoardRepr {
    size: u8,
    tiles: Vec<Placement>,
}

impl From<BoardRepr> for Board {
    fn from(repr: BoardRepr) -> Self {
        Self {
            size: repr.size,
            squares: repr.tiles.into_iter().map(|p| (p.square, p.tile)).collect(),
        }
    }
}

impl From<Board> for BoardRepr {
    fn from(board: Board) -> Self {
        Self {
            size: board.size,
            tiles: board
                .squares
                .into_iter()
                .map(|(square, tile)| Placement::new(tile, square))
                .collect(),
        }
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::new(DEFAULT_BOARD_SIZE)
    }
}

impl Board {
    /// Create an empty board.
    pub fn new(size: u8) -> Self {
        Self { size, squares: BTreeMap::new() }
    }

    /// Tile at a square, if any.
    pub fn at(&self, square: &Square) -> Option<&Tile> {
        self.squares.get(square)
    }

    /// Check that every placement targets a free square on the board.
    pub fn check_free(&self, placements: &[Placement]) -> Result<(), BoardError> {
        for (i, p) in placements.iter().enumerate() {
            if p.square.row >= self.size || p.square.col >= self.size {
                return Err(BoardError::OffBoard(p.square));
            }
            if self.squares.contains_key(&p.square)
                || placements[..i].iter().any(|q| q.square == p.square)
            {
                return Err(BoardError::Occupied(p.square));
            }
        }
        Ok(())
    }

    /// Put tiles on the board.
    pub fn place(&mut self, placements: &[Placement]) -> Result<(), BoardError> {
        self.check_free(placements)?;
        for p in placements {
            self.squares.insert(p.square, p.tile);
        }
        Ok(())
    }

    /// Lift tiles off the board, returning them in placement order.
    pub fn lift(&mut self, placements: &[Placement]) -> Result<Vec<Tile>, BoardError> {
        if let Some(p) = placements.iter().find(|p| !self.squares.contains_key(&p.square)) {
            return Err(BoardError::Empty(p.square));
        }
        Ok(placements
            .iter()
            .filter_map(|p| self.squares.remove(&p.square))
            .collect())
    }

    /// Number of tiles on the board.
    pub fn tile_count(&self) -> usize {
        self.squares.len()
    }

    /// Is the board empty?
    pub fn is_empty(&self) -> bool {
        self.squares.is_empty()
    }

    /// Iterate occupied squares in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (&Square, &Tile)> {
        self.squares.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_forms() {
        let placed = Tile::blank().with_letter('Q');
        assert_eq!(placed.letter, 'Q');
        assert_eq!(placed.to_rack_form(), Tile::blank());
        assert!(Tile::blank().matches(&placed));
        assert!(!Tile::new('Q', 10).matches(&placed));
    }

    #[test]
    fn test_blank_with_inflated_score_does_not_match() {
        let forged = Tile { score: 10, ..Tile::blank().with_letter('Z') };
        assert!(!Tile::blank().matches(&forged));
        assert!(!Tile::new('Z', 10).matches(&forged));
    }

    #[test]
    fn test_lettered_tile_ignores_letter_assignment() {
        let tile = Tile::new('A', 1);
        assert_eq!(tile.with_letter('Z'), tile);
    }

    #[test]
    fn test_place_and_lift() {
        let mut board = Board::new(15);
        let placements = [
            Placement::new(Tile::new('H', 4), Square::new(7, 7)),
            Placement::new(Tile::new('I', 1), Square::new(7, 8)),
        ];
        board.place(&placements).unwrap();
        assert_eq!(board.tile_count(), 2);
        assert_eq!(board.at(&Square::new(7, 8)), Some(&Tile::new('I', 1)));

        let lifted = board.lift(&placements).unwrap();
        assert_eq!(lifted, vec![Tile::new('H', 4), Tile::new('I', 1)]);
        assert!(board.is_empty());
    }

    #[test]
    fn test_place_rejects_occupied_and_off_board() {
        let mut board = Board::new(15);
        let first = [Placement::new(Tile::new('A', 1), Square::new(0, 0))];
        board.place(&first).unwrap();

        assert_eq!(board.place(&first), Err(BoardError::Occupied(Square::new(0, 0))));

        let off = [Placement::new(Tile::new('A', 1), Square::new(15, 0))];
        assert_eq!(board.place(&off), Err(BoardError::OffBoard(Square::new(15, 0))));

        let twice = [
            Placement::new(Tile::new('A', 1), Square::new(3, 3)),
            Placement::new(Tile::new('B', 3), Square::new(3, 3)),
        ];
        assert_eq!(board.place(&twice), Err(BoardError::Occupied(Square::new(3, 3))));
        assert_eq!(board.tile_count(), 1);
    }

    #[test]
    fn test_board_json_lists_placements() {
        let mut board = Board::new(15);
        board.place(&[Placement::new(Tile::blank().with_letter('E'), Square::new(2, 3))]).unwrap();
        let json = serde_json::to_string(&board).unwrap();
        assert!(json.contains("\"tiles\""));
        let parsed: Board = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, board);
    }

    #[test]
    fn test_lift_empty_square_changes_nothing() {
        let mut board = Board::new(15);
        let placed = [Placement::new(Tile::new('A', 1), Square::new(0, 0))];
        board.place(&placed).unwrap();

        let missing = [
            Placement::new(Tile::new('A', 1), Square::new(0, 0)),
            Placement::new(Tile::new('B', 3), Square::new(0, 1)),
        ];
        assert_eq!(board.lift(&missing), Err(BoardError::Empty(Square::new(0, 1))));
        assert_eq!(board.tile_count(), 1);
    }
}
