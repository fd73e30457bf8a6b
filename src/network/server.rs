//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections. Each connection gets
//! a channel id and an outbound queue; messages are routed to the session
//! manager, and a background task drives the session clocks.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, broadcast};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::network::manager::{Channel, ChannelId, ManagerError, SessionManager};
use crate::network::protocol::{ClientMessage, ServerMessage, ServerError, ErrorCode};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Interval between clock ticks. One tick is one clock second.
    pub tick_interval: Duration,
    /// Directory for session files. In-memory storage when `None`.
    pub games_dir: Option<PathBuf>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9093)),
            max_connections: 1000,
            tick_interval: Duration::from_secs(1),
            games_dir: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// `CROSSWORD_BIND`, `CROSSWORD_GAMES_DIR`, `CROSSWORD_MAX_CONNECTIONS`
    /// and `CROSSWORD_TICK_MS`; unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup("CROSSWORD_BIND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: lookup("CROSSWORD_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            tick_interval: lookup("CROSSWORD_TICK_MS")
                .and_then(|v| v.parse().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            games_dir: lookup("CROSSWORD_GAMES_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            version: defaults.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session manager error.
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),
}

/// Connected client state.
struct ConnectedClient {
    /// Peer address.
    addr: SocketAddr,
    /// Last message received.
    last_activity: Instant,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session manager.
    manager: Arc<SessionManager>,
    /// Connected clients by channel.
    clients: Arc<RwLock<BTreeMap<ChannelId, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server over a session manager.
    pub fn new(config: ServerConfig, manager: Arc<SessionManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            manager,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// The session manager behind this server.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Crossword server {} listening on {}", self.config.version, self.config.bind_addr);

        let clock_manager = self.manager.clone();
        let tick_interval = self.config.tick_interval;
        let clock_handle = tokio::spawn(async move {
            Self::run_clock_loop(clock_manager, tick_interval).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        clock_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let manager = self.manager.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
            let channel = manager.new_channel_id();

            clients.write().await.insert(channel, ConnectedClient {
                addr,
                last_activity: Instant::now(),
            });

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let parsed = match msg {
                            Some(Ok(Message::Text(text))) => ClientMessage::from_json(&text),
                            Some(Ok(Message::Binary(data))) => ClientMessage::from_slice(&data),
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let client_msg = match parsed {
                            Ok(m) => m,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                    ErrorCode::InvalidInput,
                                    "Invalid message format",
                                ))).await;
                                continue;
                            }
                        };

                        if let Some(client) = clients.write().await.get_mut(&channel) {
                            client.last_activity = Instant::now();
                        }

                        Self::handle_client_message(channel, client_msg, &manager, &msg_tx).await;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            manager.disconnect(channel).await;
            sender_task.abort();
            if let Some(client) = clients.write().await.remove(&channel) {
                debug!(
                    "Client {} idle for {:?} at disconnect",
                    client.addr,
                    client.last_activity.elapsed()
                );
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message, replying to the sender on success or failure.
    async fn handle_client_message(
        channel: ChannelId,
        msg: ClientMessage,
        manager: &SessionManager,
        sender: &Channel,
    ) {
        match Self::route(channel, msg, manager, sender).await {
            Ok(Some(reply)) => {
                let _ = sender.send(reply).await;
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Request on channel {} failed: {}", channel, e);
                let _ = sender.send(ServerMessage::error(&e)).await;
            }
        }
    }

    async fn route(
        channel: ChannelId,
        msg: ClientMessage,
        manager: &SessionManager,
        sender: &Channel,
    ) -> Result<Option<ServerMessage>, ManagerError> {
        match msg {
            ClientMessage::Create { config } => {
                let session_key = manager.create(config.unwrap_or_default()).await?;
                Ok(Some(ServerMessage::Created { session_key }))
            }
            ClientMessage::Join { session_key, player_key } => {
                manager.connect(&session_key, player_key, channel, sender.clone()).await?;
                Ok(None)
            }
            ClientMessage::Sit { session_key, player_key, name } => {
                manager.join(&session_key, player_key.clone(), name).await?;
                manager.connect(&session_key, Some(player_key), channel, sender.clone()).await?;
                Ok(None)
            }
            ClientMessage::Leave { session_key, player_key } => {
                manager.leave(&session_key, &player_key).await?;
                Ok(None)
            }
            ClientMessage::AddRobot { session_key } => {
                manager.add_robot(&session_key).await?;
                Ok(None)
            }
            ClientMessage::RemoveRobot { session_key } => {
                manager.remove_robot(&session_key).await?;
                Ok(None)
            }
            ClientMessage::Start { session_key } => {
                manager.start(&session_key).await?;
                Ok(None)
            }
            ClientMessage::AnotherGame { session_key } => {
                let session_key = manager.another_game(&session_key).await?;
                Ok(Some(ServerMessage::Created { session_key }))
            }
            ClientMessage::Monitor => {
                manager.connect_monitor(channel, sender.clone()).await;
                Ok(None)
            }
            ClientMessage::Command { session_key, player_key, command } => {
                manager.dispatch(&session_key, &player_key, command).await?;
                Ok(None)
            }
            ClientMessage::Ping { timestamp } => Ok(Some(ServerMessage::Pong {
                timestamp,
                server_time: Utc::now().timestamp_millis().max(0) as u64,
            })),
        }
    }

    /// Tick every session clock once per interval.
    async fn run_clock_loop(manager: Arc<SessionManager>, every: Duration) {
        let mut interval = interval(every);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            manager.tick_clocks().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
