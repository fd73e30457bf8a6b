//! # Crossword Game Server
//!
//! Authoritative server for a multiplayer tile-placement word game, with a
//! turn log that supports exact undo and deterministic redo.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CROSSWORD SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  ├── hash.rs     - State hashing for verification            │
//! │  ├── tile.rs     - Tiles, squares and the board              │
//! │  └── pool.rs     - Tile pool and draw sources                │
//! │                                                              │
//! │  game/           - Game logic (deterministic)                │
//! │  ├── player.rs   - Players and racks                         │
//! │  ├── clock.rs    - Turn and game clocks                      │
//! │  ├── turn.rs     - Turn log entries                          │
//! │  ├── session.rs  - Session data model                        │
//! │  ├── rules.rs    - Scoring and adjudication                  │
//! │  ├── engine.rs   - Apply actions                             │
//! │  └── undo.rs     - Undo and redo                             │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── manager.rs  - Session manager                           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── server.rs   - WebSocket server                          │
//! │                                                              │
//! │  store/          - Session persistence                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are deterministic apart from the
//! timestamps callers hand in:
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No system time inside the engine
//! - Organic draws come from a seeded generator stored with the pool
//! - Redo draws exactly the tiles a turn recorded
//!
//! Replaying a turn log from the same starting session produces the same
//! state hash.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use core::tile::{Board, Placement, Square, Tile};
pub use game::engine::{Action, EngineError, TurnEngine};
pub use game::session::{GameConfig, Session, SessionKey};
pub use game::turn::{Turn, TurnKind};
pub use network::manager::SessionManager;
pub use store::{FileStore, MemoryStore, SessionStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
