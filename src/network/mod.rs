//! Network Layer
//!
//! Session manager, wire protocol and WebSocket server.
//! This layer is **non-deterministic**: it owns wall-clock time, channels and
//! persistence. All game logic runs through `game/`.

pub mod protocol;
pub mod manager;
pub mod server;

pub use protocol::{ClientMessage, Command, ErrorCode, ServerError, ServerMessage};
pub use manager::{Channel, ChannelId, ManagerError, SessionManager, ROBOT_KEY};
pub use server::{GameServer, GameServerError, ServerConfig};
