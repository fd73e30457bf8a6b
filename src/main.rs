//! Crossword Game Server
//!
//! Serves sessions over WebSocket. `--demo` instead plays a short game,
//! unwinds it with undo and replays it with redo, checking the state hashes.

use std::sync::Arc;
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crossword::{
    VERSION,
    core::tile::{Placement, Square},
    game::{
        engine::{Action, TurnEngine},
        player::{Player, PlayerKey},
        rules::StandardRules,
        session::{GameConfig, Session, SessionKey},
        turn::{log_digest, Turn},
    },
    network::{GameServer, ServerConfig, SessionManager},
    store::{FileStore, MemoryStore, SessionStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Crossword Server v{}", VERSION);

    if std::env::args().any(|arg| arg == "--demo") {
        return demo_game();
    }

    let config = ServerConfig::from_env();
    let store: Arc<dyn SessionStore> = match &config.games_dir {
        Some(dir) => {
            info!("Storing sessions in {}", dir.display());
            let store = FileStore::open(dir.clone())
                .await
                .with_context(|| format!("opening games directory {}", dir.display()))?;
            Arc::new(store)
        }
        None => {
            warn!("CROSSWORD_GAMES_DIR not set, sessions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let manager = Arc::new(SessionManager::new(store, Arc::new(StandardRules::default())));
    let server = GameServer::new(config, manager);

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("Interrupted, shutting down");
            server.shutdown();
        }
    }
    Ok(())
}

/// Play a few turns, undo them all, redo them all, and check the state
/// ends up where it started each way.
fn demo_game() -> anyhow::Result<()> {
    info!("=== Starting Demo Game ===");

    let mut session = Session::new(SessionKey::from("demo"), GameConfig::default());
    session.add_player(Player::new("ann", "Ann", 7))?;
    session.add_player(Player::new("bob", "Bob", 7))?;
    session.start()?;
    for p in &mut session.players {
        p.connected = true;
    }

    let rules = StandardRules::default();
    let engine = TurnEngine::new(&rules);
    let start_hash = session.state_hash();
    info!("Start State Hash: {}", hex::encode(start_hash));

    type Step = fn(&Session) -> (PlayerKey, Action);
    let script: [Step; 5] = [
        |s| (PlayerKey::new("ann"), opening_play(s, &PlayerKey::new("ann"))),
        |_| (PlayerKey::new("bob"), Action::Challenge { challenged: PlayerKey::new("ann") }),
        |s| {
            let bob = PlayerKey::new("bob");
            let tiles = session_tiles(s, &bob, 3);
            (bob, Action::Swap { tiles })
        },
        |_| (PlayerKey::new("ann"), Action::Pass),
        |_| (PlayerKey::new("ann"), Action::Pass),
    ];

    for (i, step) in script.iter().enumerate() {
        let (actor, action) = step(&session);
        let turn = engine.apply(&mut session, &actor, action, demo_time(i as i64))?;
        info!("{}", turn);
    }

    let final_hash = session.state_hash();
    let final_digest = log_digest(&session.turns)?;
    info!("Final State Hash: {}", hex::encode(final_hash));
    info!("Turn Log Digest: {}", hex::encode(final_digest));
    for p in &session.players {
        info!("{}: {} points, rack {:?}", p, p.score, p.rack.sorted());
    }

    info!("=== Undoing ===");
    let mut undone: Vec<Turn> = Vec::new();
    while !session.turns.is_empty() {
        let turn = engine.undo(&mut session)?;
        info!("Undid {}", turn);
        undone.push(turn);
    }
    if session.state_hash() != start_hash {
        bail!("undo did not restore the starting state");
    }
    info!("UNDO VERIFIED: back at {}", hex::encode(start_hash));

    info!("=== Redoing ===");
    while let Some(turn) = undone.pop() {
        let redone = engine.redo(&mut session, &turn)?;
        info!("Redid {}", redone);
    }

    let replay_hash = session.state_hash();
    info!("Replay State Hash: {}", hex::encode(replay_hash));
    if replay_hash == final_hash && log_digest(&session.turns)? == final_digest {
        info!("DETERMINISM VERIFIED: Hashes match!");
        Ok(())
    } else {
        bail!("DETERMINISM FAILURE: Hashes differ!")
    }
}

/// Ann lays her first two tiles across the centre square.
fn opening_play(session: &Session, player: &PlayerKey) -> Action {
    let tiles = session_tiles(session, player, 2);
    let placements: Vec<Placement> = tiles
        .iter()
        .enumerate()
        .map(|(i, t)| Placement::new(t.with_letter('E'), Square::new(7, 7 + i as u8)))
        .collect();
    let word: String = placements.iter().map(|p| p.tile.letter).collect();
    Action::Play { placements, words: vec![word] }
}

fn session_tiles(session: &Session, player: &PlayerKey, n: usize) -> Vec<crossword::Tile> {
    session
        .player(player)
        .map(|p| p.rack.tiles().iter().take(n).copied().collect())
        .unwrap_or_default()
}

fn demo_time(offset: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + offset * 60, 0).unwrap_or_default()
}
