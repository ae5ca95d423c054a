//! WebSocket Duel Server
//!
//! Async WebSocket server for duel clients.
//! Accepts upgrades on the connect path, runs one session per connection and
//! owns every connection task until shutdown.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::lobby::{Lobby, LobbyConfig};
use crate::network::outbound::{ClientSender, ConnectionId};
use crate::network::session::ClientSession;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Path that accepts the WebSocket upgrade.
    pub connect_path: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection outbound queue bound.
    pub outbound_buffer: usize,
    /// Lobby settings.
    pub lobby: LobbyConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            connect_path: "/connect".to_string(),
            max_connections: 1000,
            outbound_buffer: 256,
            lobby: LobbyConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `DUEL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Missing variables keep their default; unparseable ones are logged and
    /// also keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lobby = &defaults.lobby;

        Self {
            bind_addr: parse_or(&lookup, "DUEL_BIND_ADDR", defaults.bind_addr),
            connect_path: lookup("DUEL_CONNECT_PATH")
                .filter(|p| p.starts_with('/'))
                .unwrap_or(defaults.connect_path.clone()),
            max_connections: parse_or(&lookup, "DUEL_MAX_CONNECTIONS", defaults.max_connections),
            outbound_buffer: parse_or(&lookup, "DUEL_OUTBOUND_BUFFER", defaults.outbound_buffer),
            lobby: LobbyConfig {
                rank_range: parse_or(&lookup, "DUEL_RANK_RANGE", lobby.rank_range),
                max_username_len: parse_or(&lookup, "DUEL_MAX_USERNAME_LEN", lobby.max_username_len),
                mailbox_capacity: parse_or(&lookup, "DUEL_MAILBOX_CAPACITY", lobby.mailbox_capacity),
                matchmaking_tick: millis_or(&lookup, "DUEL_MATCHMAKING_TICK_MS", lobby.matchmaking_tick),
                shutdown_grace: millis_or(&lookup, "DUEL_SHUTDOWN_GRACE_MS", lobby.shutdown_grace),
            },
            version: defaults.version.clone(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring {}={:?}: {}", name, raw, e);
                default
            }
        },
        None => default,
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_or(lookup, name, default_ms))
}

/// Duel server errors.
#[derive(Debug, thiserror::Error)]
pub enum DuelServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The duel server.
pub struct DuelServer {
    /// Server configuration.
    config: ServerConfig,
    /// Registry, searches and duels.
    lobby: Arc<Lobby>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
    /// Next connection id.
    next_id: AtomicU64,
}

impl DuelServer {
    /// Create a new duel server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            lobby: Arc::new(Lobby::new(config.lobby.clone())),
            config,
            shutdown_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), DuelServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    #[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DuelServerError> {
        info!(
            "Duel server v{} listening on {}{}",
            self.config.version,
            listener.local_addr()?,
            self.config.connect_path
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            while connections.try_join_next().is_some() {}
                            if connections.len() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            debug!("New connection {} from {}", id, addr);
                            connections.spawn(handle_connection(
                                self.lobby.clone(),
                                self.config.connect_path.clone(),
                                self.config.outbound_buffer,
                                stream,
                                addr,
                                id,
                                self.shutdown_tx.subscribe(),
                            ));
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

        let grace = self.config.lobby.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connections still open after {:?}", connections.len(), grace);
            connections.shutdown().await;
        }

        self.lobby.shutdown().await;
        info!("Duel server stopped");
        Ok(())
    }

    /// Signal every connection and the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.lobby.registry().connection_count().await
    }

    /// Shared lobby.
    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.lobby
    }
}

/// Upgrade one TCP stream and run its session until either side closes.
#[instrument(skip(lobby, connect_path, outbound_buffer, stream, shutdown_rx))]
async fn handle_connection(
    lobby: Arc<Lobby>,
    connect_path: String,
    outbound_buffer: usize,
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let check_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == connect_path {
            Ok(resp)
        } else {
            debug!("Refusing upgrade on {}", req.uri().path());
            let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };

    let ws_stream = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (client, mut outbound) = ClientSender::channel(id, outbound_buffer);

    // Spawn message sender task
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
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

    lobby.registry().open_connection(id).await;
    info!("Client {} connected", addr);
    let mut session = ClientSession::new(lobby, client);

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                    Some(Ok(Message::Binary(data))) => {
                        session.handle_text(&String::from_utf8_lossy(&data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    // Ping/pong is answered by the WebSocket layer.
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
    info!("Client {} cleaned up", addr);
}
