//! Core deterministic primitives.
//!
//! Tiles, the board, the tile pool and the seeded generator behind it.
//! Nothing here reads the system clock or any other ambient state.

pub mod rng;
pub mod hash;
pub mod tile;
pub mod pool;

// Re-export core types
pub use rng::DeterministicRng;
pub use hash::{StateHash, compute_state_hash};
pub use tile::{Tile, Square, Placement, Board, BLANK};
pub use pool::{TilePool, DrawSource, PoolError};
