//! Session Manager
//!
//! Keeps one live copy of each session, loaded from the store at most once,
//! and serializes everything that touches it: commands, connections and
//! clock ticks all run under the session's mutex. A command's store write
//! completes before anything is broadcast about it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::game::engine::{Action, EngineError, IllegalAction, TurnEngine};
use crate::game::player::{Player, PlayerKey};
use crate::game::rules::Rules;
use crate::game::session::{GameConfig, Session, SessionError, SessionKey, SessionState};
use crate::game::turn::{Turn, TurnKind};
use crate::network::protocol::{Command, ServerMessage};
use crate::store::{SessionStore, StoreError};

/// Identifies one client connection.
pub type ChannelId = u64;

/// Outbound half of a client connection.
pub type Channel = mpsc::Sender<ServerMessage>;

/// Player key given to the robot seat.
pub const ROBOT_KEY: &str = "robot";

// =============================================================================
// ERRORS
// =============================================================================

/// Session manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// No session under this key.
    #[error("Unknown session {0}")]
    UnknownSession(SessionKey),

    /// Refused by the turn engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Refused by the session lifecycle.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Durable storage failed. In-memory state keeps the change.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Redo with nothing undone.
    #[error("Nothing to redo")]
    NothingToRedo,
}

impl From<StoreError> for ManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ManagerError::UnknownSession(key),
            other => ManagerError::Store(other),
        }
    }
}

impl From<IllegalAction> for ManagerError {
    fn from(err: IllegalAction) -> Self {
        ManagerError::Engine(err.into())
    }
}

// =============================================================================
// LIVE SESSIONS
// =============================================================================

/// What a channel is attached to.
#[derive(Debug, Clone)]
enum Attachment {
    Session(SessionKey),
    Monitor,
}

/// A channel attached to a session.
struct Seat {
    /// `None` for observers.
    player: Option<PlayerKey>,
    sender: Channel,
}

/// A loaded session with its in-memory extras.
struct LiveSession {
    session: Session,
    /// Turns undone since the last forward action, most recent last.
    redo: Vec<Turn>,
    seats: BTreeMap<ChannelId, Seat>,
}

impl LiveSession {
    fn new(session: Session) -> Self {
        Self {
            session,
            redo: Vec::new(),
            seats: BTreeMap::new(),
        }
    }

    /// Recompute connection flags from the attached seats.
    fn refresh_connected(&mut self) {
        for p in &mut self.session.players {
            p.connected = self.seats.values().any(|s| s.player.as_ref() == Some(&p.key));
        }
    }

    fn connected(&self) -> Vec<PlayerKey> {
        self.session
            .players
            .iter()
            .filter(|p| p.is_connected())
            .map(|p| p.key.clone())
            .collect()
    }

    fn connections_message(&self) -> ServerMessage {
        ServerMessage::Connections {
            session_key: self.session.key.clone(),
            connected: self.connected(),
        }
    }

    /// Send to every attached channel. Full or closed channels miss out.
    fn send_all(&self, message: &ServerMessage) {
        for (id, seat) in &self.seats {
            if seat.sender.try_send(message.clone()).is_err() {
                debug!("Channel {} did not take message", id);
            }
        }
    }
}

type Slot = Arc<OnceCell<Arc<Mutex<LiveSession>>>>;

/// Internal form of a dispatched command.
enum Step {
    Act(Action),
    Undo,
    Redo,
    Pause,
    Unpause,
}

impl From<Command> for Step {
    fn from(command: Command) -> Self {
        match command {
            Command::Undo => Step::Undo,
            Command::Redo => Step::Redo,
            Command::Pause => Step::Pause,
            Command::Unpause => Step::Unpause,
            Command::Play { placements, words } => Step::Act(Action::Play { placements, words }),
            Command::Swap { tiles } => Step::Act(Action::Swap { tiles }),
            Command::Pass => Step::Act(Action::Pass),
            Command::TakeBack => Step::Act(Action::TakeBack),
            Command::Challenge { challenged } => Step::Act(Action::Challenge { challenged }),
            Command::ConfirmGameOver => Step::Act(Action::ConfirmGameOver { end_state: None }),
        }
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Owns every live session and the channels attached to them.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    rules: Arc<dyn Rules>,
    /// One slot per key; the cell fills on first successful load.
    slots: RwLock<BTreeMap<SessionKey, Slot>>,
    /// Which session or monitor set each channel belongs to.
    channels: RwLock<BTreeMap<ChannelId, Attachment>>,
    /// Session-list observers.
    monitors: RwLock<BTreeMap<ChannelId, Channel>>,
    next_channel: AtomicU64,
}

impl SessionManager {
    /// Create a manager over a store and a rules implementation.
    pub fn new(store: Arc<dyn SessionStore>, rules: Arc<dyn Rules>) -> Self {
        Self {
            store,
            rules,
            slots: RwLock::new(BTreeMap::new()),
            channels: RwLock::new(BTreeMap::new()),
            monitors: RwLock::new(BTreeMap::new()),
            next_channel: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new connection.
    pub fn new_channel_id(&self) -> ChannelId {
        self.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // LOADING
    // =========================================================================

    /// The live session for `key`, loading it on first use.
    ///
    /// Concurrent callers for the same key share one store load. A failed
    /// load leaves the slot empty for the next caller to retry.
    async fn slot(&self, key: &SessionKey) -> Result<Arc<Mutex<LiveSession>>, ManagerError> {
        let cell = {
            let mut slots = self.slots.write().await;
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let loaded = cell
            .get_or_try_init(|| async {
                let session = self.store.load(key).await?;
                info!("Loaded session {} with {} turns", key, session.turns.len());
                Ok::<_, ManagerError>(Arc::new(Mutex::new(LiveSession::new(session))))
            })
            .await;

        match loaded {
            Ok(live) => Ok(live.clone()),
            Err(err) => {
                if matches!(err, ManagerError::UnknownSession(_)) {
                    let mut slots = self.slots.write().await;
                    if slots.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell) && c.get().is_none()) {
                        slots.remove(key);
                    }
                }
                Err(err)
            }
        }
    }

    /// Already-loaded session, without touching the store.
    async fn cached(&self, key: &SessionKey) -> Option<Arc<Mutex<LiveSession>>> {
        self.slots.read().await.get(key).and_then(|c| c.get().cloned())
    }

    /// Snapshot of a session, loading it if needed.
    pub async fn load(&self, key: &SessionKey) -> Result<Session, ManagerError> {
        let live = self.slot(key).await?;
        let live = live.lock().await;
        Ok(live.session.clone())
    }

    /// Create, persist and register a new waiting session.
    pub async fn create(&self, config: GameConfig) -> Result<SessionKey, ManagerError> {
        let session = Session::new(SessionKey::generate(), config);
        let key = session.key.clone();
        self.insert(session).await?;
        Ok(key)
    }

    /// Persist and register an existing session, replacing any live copy.
    pub async fn insert(&self, session: Session) -> Result<(), ManagerError> {
        self.store.save(&session).await?;
        let key = session.key.clone();
        let summary = ServerMessage::Update(session.summary());
        let cell = OnceCell::new_with(Some(Arc::new(Mutex::new(LiveSession::new(session)))));
        self.slots.write().await.insert(key.clone(), Arc::new(cell));
        info!("Registered session {}", key);
        self.notify_monitors(&summary).await;
        Ok(())
    }

    /// Keys of every stored session.
    pub async fn list_keys(&self) -> Result<Vec<SessionKey>, ManagerError> {
        Ok(self.store.list_keys().await?)
    }

    /// Players of a session with a live channel, robots included.
    pub async fn connections(&self, key: &SessionKey) -> Result<Vec<PlayerKey>, ManagerError> {
        let live = self.slot(key).await?;
        let live = live.lock().await;
        Ok(live.connected())
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Run a player's command against a session.
    ///
    /// Returns the turns appended to the log, or for `Undo` the turn that
    /// was reversed. Nothing is broadcast unless the store write succeeds;
    /// a failed write leaves the change applied in memory.
    #[instrument(skip(self, command), fields(session = %key, player = %player))]
    pub async fn dispatch(
        &self,
        key: &SessionKey,
        player: &PlayerKey,
        command: Command,
    ) -> Result<Vec<Turn>, ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        self.run(&mut live, player, command.into(), Utc::now()).await
    }

    /// Apply a clock expiry as a timeout.
    ///
    /// The expiry is dropped unless `generation` still matches the player's
    /// clock and the player is still on the move.
    #[instrument(skip(self), fields(session = %key, player = %player))]
    pub async fn dispatch_timeout(
        &self,
        key: &SessionKey,
        player: &PlayerKey,
        generation: u64,
    ) -> Result<Vec<Turn>, ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;

        let current = live.session.player(player).map(|p| p.clock.generation);
        if current != Some(generation) || live.session.whose_turn.as_ref() != Some(player) {
            debug!("Discarding stale expiry, generation {} vs {:?}", generation, current);
            return Ok(Vec::new());
        }
        self.run(&mut live, player, Step::Act(Action::TimeOut), Utc::now()).await
    }

    async fn run(
        &self,
        live: &mut LiveSession,
        player: &PlayerKey,
        step: Step,
        now: DateTime<Utc>,
    ) -> Result<Vec<Turn>, ManagerError> {
        let engine = TurnEngine::new(self.rules.as_ref());
        let key = live.session.key.clone();
        let turn_before = live.session.whose_turn.clone();
        let state_before = live.session.state;
        let paused_before = live.session.is_paused();

        let mut turns = Vec::new();
        let mut messages = Vec::new();
        let mut new_turn_started = false;
        let mut resume = false;

        match step {
            Step::Undo => {
                require_player(&live.session, player)?;
                let turn = engine.undo(&mut live.session)?;
                debug!("Undid {}", turn);
                new_turn_started = turn.kind.consumes_turn();
                live.redo.push(turn.clone());
                messages.push(ServerMessage::Undone { session_key: key.clone(), turn: turn.clone() });
                turns.push(turn);
            }
            Step::Redo => {
                require_player(&live.session, player)?;
                let turn = live.redo.last().cloned().ok_or(ManagerError::NothingToRedo)?;
                let redone = engine.redo(&mut live.session, &turn)?;
                debug!("Redid {}", redone);
                live.redo.pop();
                messages.push(ServerMessage::Turn { session_key: key.clone(), turn: redone.clone() });
                turns.push(redone);
            }
            Step::Pause => {
                pause(&mut live.session, player)?;
                messages.push(ServerMessage::Paused { session_key: key.clone(), by: player.clone() });
            }
            Step::Unpause => {
                unpause(&mut live.session, player)?;
                resume = true;
                messages.push(ServerMessage::Unpaused { session_key: key.clone(), by: player.clone() });
            }
            Step::Act(action) => {
                if live.session.state == SessionState::GameOver
                    && matches!(action, Action::ConfirmGameOver { .. })
                {
                    debug!("Game already over, confirmation ignored");
                    return Ok(Vec::new());
                }
                let consumes = action.consumes_turn();
                let turn = engine.apply(&mut live.session, player, action, now)?;
                debug!("Applied {}", turn);
                live.redo.clear();
                turns.push(turn);
                if consumes {
                    if let Some(end) = finish_if_over(&engine, &mut live.session, player, now) {
                        turns.push(end);
                    }
                }
                for turn in &turns {
                    messages.push(ServerMessage::Turn { session_key: key.clone(), turn: turn.clone() });
                }
            }
        }

        let session = &mut live.session;
        if resume {
            session.resume_clocks();
        } else if new_turn_started
            || turns.iter().any(|t| t.kind.consumes_turn() || t.kind == TurnKind::GameEnded)
            || session.whose_turn != turn_before
            || session.state != state_before
            || session.is_paused() != paused_before
        {
            session.arm_clocks();
        }

        self.store.save(&live.session).await?;

        for message in &messages {
            live.send_all(message);
        }
        self.notify_monitors(&ServerMessage::Update(live.session.summary())).await;
        Ok(turns)
    }

    // =========================================================================
    // SEATING
    // =========================================================================

    /// Seat a new player in a waiting session.
    #[instrument(skip(self, name), fields(session = %key, player = %player))]
    pub async fn join(&self, key: &SessionKey, player: PlayerKey, name: String) -> Result<(), ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        let rack_size = live.session.config.rack_size;
        live.session.add_player(Player::new(player, name, rack_size))?;
        live.refresh_connected();
        self.commit_seating(&mut live).await
    }

    /// Unseat a player from a waiting session.
    #[instrument(skip(self), fields(session = %key, player = %player))]
    pub async fn leave(&self, key: &SessionKey, player: &PlayerKey) -> Result<(), ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        live.session.remove_player(player)?;
        for seat in live.seats.values_mut() {
            if seat.player.as_ref() == Some(player) {
                seat.player = None;
            }
        }
        live.refresh_connected();
        self.commit_seating(&mut live).await
    }

    /// Seat the robot.
    pub async fn add_robot(&self, key: &SessionKey) -> Result<(), ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        if live.session.has_robot() {
            return Err(IllegalAction::RobotPresent.into());
        }
        let rack_size = live.session.config.rack_size;
        live.session.add_player(Player::robot(ROBOT_KEY, "Robot", rack_size))?;
        self.commit_seating(&mut live).await
    }

    /// Unseat the robot.
    pub async fn remove_robot(&self, key: &SessionKey) -> Result<(), ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        let robot = live
            .session
            .players
            .iter()
            .find(|p| p.is_robot)
            .map(|p| p.key.clone())
            .ok_or(IllegalAction::NoRobot)?;
        live.session.remove_player(&robot)?;
        self.commit_seating(&mut live).await
    }

    /// Begin play.
    #[instrument(skip(self), fields(session = %key))]
    pub async fn start(&self, key: &SessionKey) -> Result<(), ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        live.session.start()?;
        live.session.last_activity = Utc::now();
        live.session.arm_clocks();
        info!("Session {} started with {} players", key, live.session.players.len());
        self.commit_seating(&mut live).await
    }

    /// Start a follow-on game with the same players and options.
    ///
    /// Idempotent: a session that already has a successor returns it.
    #[instrument(skip(self), fields(session = %key))]
    pub async fn another_game(&self, key: &SessionKey) -> Result<SessionKey, ManagerError> {
        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        if let Some(next) = &live.session.next_session_key {
            return Ok(next.clone());
        }
        if live.session.state != SessionState::GameOver {
            return Err(SessionError::GameInProgress.into());
        }

        let mut next = Session::new(SessionKey::generate(), live.session.config.clone());
        let rack_size = next.config.rack_size;
        for p in &live.session.players {
            let seat = if p.is_robot {
                Player::robot(p.key.clone(), p.name.clone(), rack_size)
            } else {
                Player::new(p.key.clone(), p.name.clone(), rack_size)
            };
            next.add_player(seat)?;
        }
        next.start()?;
        next.arm_clocks();
        let next_key = next.key.clone();

        // Successor is durable before anything points at it
        self.insert(next).await?;
        live.session.next_session_key = Some(next_key.clone());
        info!("Session {} continues as {}", key, next_key);
        self.commit_seating(&mut live).await?;
        Ok(next_key)
    }

    async fn commit_seating(&self, live: &mut LiveSession) -> Result<(), ManagerError> {
        self.store.save(&live.session).await?;
        let update = ServerMessage::Update(live.session.summary());
        live.send_all(&update);
        live.send_all(&live.connections_message());
        self.notify_monitors(&update).await;
        Ok(())
    }

    // =========================================================================
    // CHANNELS
    // =========================================================================

    /// Attach a channel to a session, as `player` or as an observer.
    ///
    /// A player reconnecting on a new channel replaces their old one.
    #[instrument(skip(self, sender), fields(session = %key))]
    pub async fn connect(
        &self,
        key: &SessionKey,
        player: Option<PlayerKey>,
        channel: ChannelId,
        sender: Channel,
    ) -> Result<(), ManagerError> {
        // Leave any previous attachment before taking this session's lock
        self.disconnect(channel).await;

        let live = self.slot(key).await?;
        let mut live = live.lock().await;
        if let Some(p) = &player {
            require_player(&live.session, p)?;
        }

        let stale: Vec<ChannelId> = match &player {
            Some(p) => live
                .seats
                .iter()
                .filter(|(_, seat)| seat.player.as_ref() == Some(p))
                .map(|(id, _)| *id)
                .collect(),
            None => Vec::new(),
        };
        for id in &stale {
            live.seats.remove(id);
        }
        live.seats.insert(channel, Seat { player: player.clone(), sender });
        live.refresh_connected();

        {
            let mut channels = self.channels.write().await;
            for id in &stale {
                channels.remove(id);
            }
            channels.insert(channel, Attachment::Session(key.clone()));
        }

        match &player {
            Some(p) if !stale.is_empty() => info!("Player {} reconnected on channel {}", p, channel),
            Some(p) => info!("Player {} connected on channel {}", p, channel),
            None => info!("Observer connected on channel {}", channel),
        }
        live.send_all(&live.connections_message());
        Ok(())
    }

    /// Register a session-list observer and send it the loaded sessions.
    ///
    /// The observer is registered before the snapshot is taken, so no update
    /// falls between the two.
    pub async fn connect_monitor(&self, channel: ChannelId, sender: Channel) {
        self.disconnect(channel).await;
        self.monitors.write().await.insert(channel, sender.clone());
        self.channels.write().await.insert(channel, Attachment::Monitor);

        let loaded: Vec<Arc<Mutex<LiveSession>>> = self
            .slots
            .read()
            .await
            .values()
            .filter_map(|c| c.get().cloned())
            .collect();
        for live in loaded {
            let summary = live.lock().await.session.summary();
            let _ = sender.try_send(ServerMessage::Update(summary));
        }
        debug!("Monitor connected on channel {}", channel);
    }

    /// Detach a channel from whatever holds it. Unknown channels are ignored.
    pub async fn disconnect(&self, channel: ChannelId) {
        let attachment = self.channels.write().await.remove(&channel);
        match attachment {
            None => {}
            Some(Attachment::Monitor) => {
                self.monitors.write().await.remove(&channel);
                debug!("Monitor on channel {} disconnected", channel);
            }
            Some(Attachment::Session(key)) => {
                let Some(live) = self.cached(&key).await else { return };
                let mut live = live.lock().await;
                if let Some(seat) = live.seats.remove(&channel) {
                    live.refresh_connected();
                    info!(
                        "Channel {} left session {} (player {:?})",
                        channel,
                        key,
                        seat.player.as_ref().map(|p| p.as_str())
                    );
                    live.send_all(&live.connections_message());
                }
            }
        }
    }

    async fn notify_monitors(&self, message: &ServerMessage) {
        for (id, sender) in self.monitors.read().await.iter() {
            if sender.try_send(message.clone()).is_err() {
                debug!("Monitor {} did not take update", id);
            }
        }
    }

    // =========================================================================
    // CLOCKS
    // =========================================================================

    /// Advance every running clock by one second.
    ///
    /// Running clocks are reported with `Tick`; expiries go back through
    /// [`dispatch_timeout`](Self::dispatch_timeout). A timeout that cannot
    /// be applied is logged and dropped.
    pub async fn tick_clocks(&self) {
        let loaded: Vec<(SessionKey, Arc<Mutex<LiveSession>>)> = self
            .slots
            .read()
            .await
            .iter()
            .filter_map(|(k, c)| c.get().map(|live| (k.clone(), live.clone())))
            .collect();

        for (key, live) in loaded {
            let expiries = {
                let mut live = live.lock().await;
                let expiries = live.session.tick_clocks();
                let ticks: Vec<ServerMessage> = live
                    .session
                    .players
                    .iter()
                    .filter(|p| p.clock.is_running() || expiries.iter().any(|(k, _)| k == &p.key))
                    .filter_map(|p| {
                        p.clock.remaining.map(|remaining| ServerMessage::Tick {
                            session_key: key.clone(),
                            player_key: p.key.clone(),
                            remaining,
                        })
                    })
                    .collect();
                for tick in &ticks {
                    live.send_all(tick);
                }
                expiries
            };

            for (player, expiry) in expiries {
                if let Err(e) = self.dispatch_timeout(&key, &player, expiry.generation).await {
                    warn!("Dropped timeout for {} in {}: {}", player, key, e);
                }
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_player(session: &Session, player: &PlayerKey) -> Result<(), EngineError> {
    match session.player(player) {
        Some(_) => Ok(()),
        None => Err(EngineError::UnknownPlayer(player.clone())),
    }
}

fn pause(session: &mut Session, player: &PlayerKey) -> Result<(), ManagerError> {
    require_player(session, player)?;
    match session.state {
        SessionState::Waiting => return Err(IllegalAction::NotPlaying.into()),
        SessionState::GameOver => return Err(IllegalAction::GameEnded.into()),
        SessionState::Playing => {}
    }
    if let Some(by) = &session.paused_by {
        return Err(IllegalAction::Paused(by.clone()).into());
    }
    session.paused_by = Some(player.clone());
    info!("Paused by {}", player);
    Ok(())
}

fn unpause(session: &mut Session, player: &PlayerKey) -> Result<(), ManagerError> {
    require_player(session, player)?;
    if session.paused_by.take().is_none() {
        return Err(IllegalAction::NotPaused.into());
    }
    info!("Unpaused by {}", player);
    Ok(())
}

/// Append the ending when the rules report one that needs no confirmation.
fn finish_if_over(
    engine: &TurnEngine<'_>,
    session: &mut Session,
    actor: &PlayerKey,
    at: DateTime<Utc>,
) -> Option<Turn> {
    let end = engine.rules().game_over(session)?;
    if !end.confirms_automatically() {
        return None;
    }
    match engine.apply(session, actor, Action::ConfirmGameOver { end_state: Some(end) }, at) {
        Ok(turn) => {
            info!("Game over: {}", end);
            Some(turn)
        }
        Err(e) => {
            warn!("Could not end game ({}): {}", end, e);
            None
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use async_trait::async_trait;
    use crate::game::clock::TimerMode;
    use crate::game::rules::StandardRules;
    use crate::game::turn::EndState;
    use crate::store::MemoryStore;

    /// Memory store that counts loads, answers slowly and can refuse saves.
    #[derive(Default)]
    struct TestStore {
        inner: MemoryStore,
        loads: AtomicUsize,
        fail_saves: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for TestStore {
        async fn load(&self, key: &SessionKey) -> Result<Session, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.load(key).await
        }

        async fn save(&self, session: &Session) -> Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            self.inner.save(session).await
        }

        async fn list_keys(&self) -> Result<Vec<SessionKey>, StoreError> {
            self.inner.list_keys().await
        }

        async fn remove(&self, key: &SessionKey) -> Result<(), StoreError> {
            self.inner.remove(key).await
        }
    }

    fn manager() -> (Arc<SessionManager>, Arc<TestStore>) {
        let store = Arc::new(TestStore::default());
        let manager = SessionManager::new(store.clone(), Arc::new(StandardRules::default()));
        (Arc::new(manager), store)
    }

    fn key(k: &str) -> PlayerKey {
        PlayerKey::new(k)
    }

    async fn started(manager: &SessionManager, config: GameConfig) -> SessionKey {
        let session = manager.create(config).await.unwrap();
        manager.join(&session, key("a"), "Ann".into()).await.unwrap();
        manager.join(&session, key("b"), "Bob".into()).await.unwrap();
        manager.start(&session).await.unwrap();
        session
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(m) = rx.try_recv() {
            messages.push(m);
        }
        messages
    }

    #[tokio::test]
    async fn test_dispatch_applies_persists_and_broadcasts() {
        let (manager, store) = manager();
        let session = started(&manager, GameConfig::default()).await;

        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("b")), 1, tx).await.unwrap();
        let (mon_tx, mut mon_rx) = mpsc::channel(64);
        manager.connect_monitor(2, mon_tx).await;
        drain(&mut rx);
        drain(&mut mon_rx);

        let turns = manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].kind, TurnKind::Passed);

        let stored = store.inner.load(&session).await.unwrap();
        assert_eq!(stored.turns.len(), 1);
        assert_eq!(stored.whose_turn, Some(key("b")));

        let messages = drain(&mut rx);
        assert!(matches!(&messages[..], [ServerMessage::Turn { turn, .. }] if turn.kind == TurnKind::Passed));
        let updates = drain(&mut mon_rx);
        assert!(matches!(&updates[..], [ServerMessage::Update(s)] if s.turns == 1));
    }

    #[tokio::test]
    async fn test_illegal_action_is_not_broadcast() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("a")), 1, tx).await.unwrap();
        drain(&mut rx);

        let err = manager.dispatch(&session, &key("b"), Command::Pass).await.unwrap_err();
        assert!(matches!(err, ManagerError::Engine(EngineError::Illegal(IllegalAction::NotYourTurn))));
        assert!(drain(&mut rx).is_empty());
        assert!(manager.load(&session).await.unwrap().turns.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatches_never_interleave() {
        for _ in 0..10 {
            let (manager, _) = manager();
            let session = started(&manager, GameConfig::default()).await;

            let first = {
                let (manager, session) = (manager.clone(), session.clone());
                tokio::spawn(async move { manager.dispatch(&session, &key("a"), Command::Pass).await })
            };
            let second = {
                let (manager, session) = (manager.clone(), session.clone());
                tokio::spawn(async move { manager.dispatch(&session, &key("b"), Command::Pass).await })
            };
            let a = first.await.unwrap();
            let b = second.await.unwrap();
            assert!(a.is_ok());

            let state = manager.load(&session).await.unwrap();
            match b {
                // b saw a's pass and moved second
                Ok(_) => {
                    assert_eq!(state.turns.len(), 2);
                    assert_eq!(state.turns[0].player_key, key("a"));
                    assert_eq!(state.turns[1].prior_to_go, Some(key("b")));
                    assert_eq!(state.whose_turn, Some(key("a")));
                }
                // b was judged before a moved
                Err(e) => {
                    assert!(matches!(e, ManagerError::Engine(EngineError::Illegal(IllegalAction::NotYourTurn))));
                    assert_eq!(state.turns.len(), 1);
                    assert_eq!(state.whose_turn, Some(key("b")));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_hit_store_once() {
        let (manager, store) = manager();
        let mut session = Session::new(SessionKey::from("stored"), GameConfig::default());
        session.add_player(Player::new("a", "Ann", 7)).unwrap();
        store.inner.save(&session).await.unwrap();

        let loads = (0..8).map(|_| manager.load(&session.key));
        let results = futures_util::future::join_all(loads).await;
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|s| s.players.len() == 1)));
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        let err = manager.load(&SessionKey::from("missing")).await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_change_and_skips_broadcast() {
        let (manager, store) = manager();
        let session = started(&manager, GameConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("a")), 1, tx).await.unwrap();
        drain(&mut rx);

        store.fail_saves.store(true, Ordering::SeqCst);
        let err = manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap_err();
        assert!(matches!(err, ManagerError::Store(_)));
        assert!(drain(&mut rx).is_empty());

        let live = manager.load(&session).await.unwrap();
        assert_eq!(live.turns.len(), 1);
        assert_eq!(store.inner.load(&session).await.unwrap().turns.len(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_channel() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;

        let (old_tx, _old_rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("a")), 1, old_tx).await.unwrap();
        let (new_tx, mut new_rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("a")), 2, new_tx).await.unwrap();
        assert_eq!(manager.connections(&session).await.unwrap(), vec![key("a")]);

        // The replaced channel going away does not drop the player
        manager.disconnect(1).await;
        assert_eq!(manager.connections(&session).await.unwrap(), vec![key("a")]);

        drain(&mut new_rx);
        manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
        assert_eq!(drain(&mut new_rx).len(), 1);

        manager.disconnect(2).await;
        assert!(manager.connections(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_observer_gets_turns() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&session, None, 7, tx).await.unwrap();
        assert!(manager.connections(&session).await.unwrap().is_empty());

        drain(&mut rx);
        manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
        assert!(matches!(&drain(&mut rx)[..], [ServerMessage::Turn { .. }]));
    }

    #[tokio::test]
    async fn test_undo_redo_through_manager() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
        let after_pass = manager.load(&session).await.unwrap();

        let undone = manager.dispatch(&session, &key("b"), Command::Undo).await.unwrap();
        assert_eq!(undone[0].kind, TurnKind::Passed);
        assert!(manager.load(&session).await.unwrap().turns.is_empty());

        manager.dispatch(&session, &key("a"), Command::Redo).await.unwrap();
        let redone = manager.load(&session).await.unwrap();
        assert_eq!(redone.turns, after_pass.turns);
        assert_eq!(redone.state_hash(), after_pass.state_hash());

        let err = manager.dispatch(&session, &key("a"), Command::Redo).await.unwrap_err();
        assert!(matches!(err, ManagerError::NothingToRedo));

        // A forward action forgets undone turns
        manager.dispatch(&session, &key("a"), Command::Undo).await.unwrap();
        manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
        let err = manager.dispatch(&session, &key("a"), Command::Redo).await.unwrap_err();
        assert!(matches!(err, ManagerError::NothingToRedo));
    }

    #[tokio::test]
    async fn test_all_passed_ends_game_automatically() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        for who in ["a", "b", "a"] {
            let turns = manager.dispatch(&session, &key(who), Command::Pass).await.unwrap();
            assert_eq!(turns.len(), 1);
        }
        let turns = manager.dispatch(&session, &key("b"), Command::Pass).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].kind, TurnKind::GameEnded);
        assert_eq!(turns[1].end_state, Some(EndState::AllPassed));

        let state = manager.load(&session).await.unwrap();
        assert_eq!(state.state, SessionState::GameOver);

        // Confirming again changes nothing
        let again = manager.dispatch(&session, &key("a"), Command::ConfirmGameOver).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(manager.load(&session).await.unwrap().turns.len(), 5);
    }

    #[tokio::test]
    async fn test_pause_blocks_play() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("a")), 1, tx).await.unwrap();
        drain(&mut rx);

        manager.dispatch(&session, &key("b"), Command::Pause).await.unwrap();
        assert!(matches!(&drain(&mut rx)[..], [ServerMessage::Paused { by, .. }] if *by == key("b")));

        let err = manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap_err();
        assert!(matches!(err, ManagerError::Engine(EngineError::Illegal(IllegalAction::Paused(_)))));

        manager.dispatch(&session, &key("a"), Command::Unpause).await.unwrap();
        let err = manager.dispatch(&session, &key("a"), Command::Unpause).await.unwrap_err();
        assert!(matches!(err, ManagerError::Engine(EngineError::Illegal(IllegalAction::NotPaused))));
        manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
    }

    #[tokio::test]
    async fn test_turn_clock_expiry_times_out_player() {
        let (manager, _) = manager();
        let config = GameConfig { timer: TimerMode::Turn, time_limit: 2, ..GameConfig::default() };
        let session = started(&manager, config).await;
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect(&session, Some(key("b")), 1, tx).await.unwrap();
        drain(&mut rx);

        manager.tick_clocks().await;
        assert!(matches!(
            &drain(&mut rx)[..],
            [ServerMessage::Tick { player_key, remaining: 1, .. }] if *player_key == key("a")
        ));
        manager.tick_clocks().await;

        let state = manager.load(&session).await.unwrap();
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].kind, TurnKind::TimedOut);
        assert_eq!(state.whose_turn, Some(key("b")));
        let b = state.player(&key("b")).unwrap();
        assert!(b.clock.is_running());
        assert_eq!(b.clock.remaining, Some(2));
    }

    #[tokio::test]
    async fn test_stale_expiry_is_discarded() {
        let (manager, _) = manager();
        let config = GameConfig { timer: TimerMode::Turn, time_limit: 30, ..GameConfig::default() };
        let session = started(&manager, config).await;
        let stale = manager.load(&session).await.unwrap().player(&key("a")).unwrap().clock.generation;

        // a passes; their clock is stopped and re-armed later under a new generation
        manager.dispatch(&session, &key("a"), Command::Pass).await.unwrap();
        manager.dispatch(&session, &key("b"), Command::Pass).await.unwrap();

        let turns = manager.dispatch_timeout(&session, &key("a"), stale).await.unwrap();
        assert!(turns.is_empty());
        assert_eq!(manager.load(&session).await.unwrap().turns.len(), 2);
    }

    #[tokio::test]
    async fn test_game_clock_expiry_ends_game_with_time_penalty() {
        let (manager, _) = manager();
        let config = GameConfig {
            timer: TimerMode::Game,
            time_limit: 2,
            time_penalty: 7,
            ..GameConfig::default()
        };
        let session = started(&manager, config).await;
        let racks: BTreeMap<PlayerKey, i32> = manager
            .load(&session)
            .await
            .unwrap()
            .players
            .iter()
            .map(|p| (p.key.clone(), p.rack.face_value()))
            .collect();

        manager.tick_clocks().await;
        manager.tick_clocks().await;

        let ended = manager.load(&session).await.unwrap();
        let kinds: Vec<TurnKind> = ended.turns.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TurnKind::TimedOut, TurnKind::GameEnded]);
        assert_eq!(ended.state, SessionState::GameOver);
        let end = ended.turns.last().unwrap();
        assert_eq!(end.end_state, Some(EndState::TimedOut));
        assert_eq!(end.deltas.get(&key("a")), Some(&(-racks[&key("a")] - 7)));
        assert_eq!(end.deltas.get(&key("b")), Some(&-racks[&key("b")]));
        assert_eq!(ended.player(&key("a")).unwrap().score, -racks[&key("a")] - 7);

        let undone = manager.dispatch(&session, &key("b"), Command::Undo).await.unwrap();
        assert_eq!(undone[0].kind, TurnKind::GameEnded);
        let reopened = manager.load(&session).await.unwrap();
        assert_eq!(reopened.state, SessionState::Playing);
        assert!(reopened.players.iter().all(|p| p.score == 0));

        let redone = manager.dispatch(&session, &key("b"), Command::Redo).await.unwrap();
        assert_eq!(redone[0].deltas, end.deltas);
        let replayed = manager.load(&session).await.unwrap();
        assert_eq!(replayed.state_hash(), ended.state_hash());
    }

    #[tokio::test]
    async fn test_monitor_hears_updates_sent_during_snapshot() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        let live = manager.slot(&session).await.unwrap();
        let guard = live.lock().await;

        let (tx, mut rx) = mpsc::channel(64);
        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect_monitor(9, tx).await })
        };

        // The snapshot waits on the session lock held above
        tokio::time::timeout(Duration::from_secs(1), async {
            while !manager.monitors.read().await.contains_key(&9) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("monitor registered before the snapshot");
        manager.notify_monitors(&ServerMessage::Update(guard.session.summary())).await;
        drop(guard);
        connecting.await.unwrap();

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|m| matches!(m, ServerMessage::Update(s) if s.key == session)));
    }

    #[tokio::test]
    async fn test_robot_seating() {
        let (manager, _) = manager();
        let session = manager.create(GameConfig::default()).await.unwrap();
        manager.join(&session, key("a"), "Ann".into()).await.unwrap();

        let err = manager.remove_robot(&session).await.unwrap_err();
        assert!(matches!(err, ManagerError::Engine(EngineError::Illegal(IllegalAction::NoRobot))));

        manager.add_robot(&session).await.unwrap();
        let err = manager.add_robot(&session).await.unwrap_err();
        assert!(matches!(err, ManagerError::Engine(EngineError::Illegal(IllegalAction::RobotPresent))));
        assert_eq!(manager.connections(&session).await.unwrap(), vec![key(ROBOT_KEY)]);

        manager.remove_robot(&session).await.unwrap();
        assert_eq!(manager.load(&session).await.unwrap().players.len(), 1);
    }

    #[tokio::test]
    async fn test_another_game_is_idempotent() {
        let (manager, _) = manager();
        let session = started(&manager, GameConfig::default()).await;
        let err = manager.another_game(&session).await.unwrap_err();
        assert!(matches!(err, ManagerError::Session(SessionError::GameInProgress)));

        for who in ["a", "b", "a", "b"] {
            manager.dispatch(&session, &key(who), Command::Pass).await.unwrap();
        }
        let next = manager.another_game(&session).await.unwrap();
        assert_eq!(manager.another_game(&session).await.unwrap(), next);

        let follow_on = manager.load(&next).await.unwrap();
        assert_eq!(follow_on.state, SessionState::Playing);
        let keys: Vec<&str> = follow_on.players.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(follow_on.players.iter().all(|p| p.score == 0 && p.rack.len() == 7));

        let mut listed = manager.list_keys().await.unwrap();
        listed.sort();
        let mut expected = vec![session.clone(), next];
        expected.sort();
        assert_eq!(listed, expected);
    }
}
