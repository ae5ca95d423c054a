//! Player Registry
//!
//! Process-wide directory of registered players and live connections. One
//! exclusive lock guards membership, status and rank; every operation below
//! runs entirely inside it, so no caller can observe a half-applied change.
//!
//! Transitions that acknowledge something to a client (registration, search
//! start, pairing) queue that acknowledgment inside the same critical section,
//! which keeps it ordered before any message caused by a later transition.

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tracing::{debug, info, warn};

use crate::duel::{DuelOutcome, DuelPairing, DuelSeat};
use crate::lobby::matchmaker::closest_opponent;
use crate::lobby::player::{
    DuelId, DuelLink, DuelMessage, DuelPayload, Player, PlayerSnapshot, PlayerState, PlayerStatus,
};
use crate::lobby::LobbyConfig;
use crate::network::outbound::{ClientSender, ConnectionId};
use crate::network::protocol::{NewPlayerAck, PlayerSummary, Seat, ServerMessage};

/// Validation failures reported back to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    /// Username is taken.
    #[error("Player with username \"{0}\" already exists")]
    AlreadyExists(String),

    /// Connection already owns a player.
    #[error("Player is already registered on connection")]
    AlreadyRegistered,

    /// Username too long.
    #[error("Username must be under {} characters", .max + 1)]
    InvalidUsername {
        /// Longest accepted username.
        max: usize,
    },

    /// Connection owns no player.
    #[error("Player is not registered")]
    NotRegistered,

    /// Player is already matchmaking or dueling.
    #[error("Player already entered duel")]
    AlreadyInDuel,

    /// Duel message outside of a duel.
    #[error("Player is not dueling")]
    NotDueling,

    /// `game-end` naming someone outside the duel.
    #[error("Winner must be one of the duel participants")]
    InvalidWinner,
}

/// Pairing refused because the pair is no longer eligible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot pair \"{left}\" with \"{right}\"")]
pub struct PairingRejected {
    /// Seeker.
    pub left: String,
    /// Proposed opponent.
    pub right: String,
}

/// Result of one matchmaking scan.
#[derive(Debug)]
pub enum PairAttempt {
    /// Both players are now dueling.
    Paired(DuelPairing),
    /// No eligible opponent yet.
    Pending,
    /// Seeker left the registry or is no longer matchmaking.
    Abandoned,
}

/// Permission to push into a dueling player's mailbox.
#[derive(Debug)]
pub struct DuelTicket {
    /// Duel the ticket was issued for.
    pub duel: DuelId,
    mailbox: mpsc::Sender<DuelMessage>,
    finished: watch::Receiver<bool>,
}

impl DuelTicket {
    /// Push a message into the mailbox, waiting while it is full.
    ///
    /// Gives up with `NotDueling` if the duel finishes before there is room.
    pub async fn deliver(mut self, payload: DuelPayload) -> Result<(), LobbyError> {
        let message = DuelMessage { duel: self.duel, payload };
        tokio::select! {
            biased;
            sent = self.mailbox.send(message) => sent.map_err(|_| LobbyError::NotDueling),
            _ = self.finished.wait_for(|done| *done) => Err(LobbyError::NotDueling),
        }
    }
}

/// What `remove` took out of the registry.
#[derive(Debug)]
pub struct Departure {
    /// Player as it was at removal.
    pub player: PlayerSnapshot,
    /// Set when the player was dueling; used to resign.
    pub resignation: Option<DuelTicket>,
}

#[derive(Debug, Default)]
struct RegistryState {
    players: BTreeMap<String, Player>,
    connections: BTreeSet<ConnectionId>,
}

impl RegistryState {
    fn owned(&self, username: &str, connection: ConnectionId) -> Result<&Player, LobbyError> {
        self.players
            .get(username)
            .filter(|p| p.connection == connection)
            .ok_or(LobbyError::NotRegistered)
    }

    fn owned_mut(&mut self, username: &str, connection: ConnectionId) -> Result<&mut Player, LobbyError> {
        self.players
            .get_mut(username)
            .filter(|p| p.connection == connection)
            .ok_or(LobbyError::NotRegistered)
    }

    /// Matchmaking -> Dueling for both players, plus the `found` acks.
    fn pair(&mut self, left: &str, right: &str) -> Result<DuelPairing, PairingRejected> {
        let rejected = || PairingRejected { left: left.to_string(), right: right.to_string() };
        if left == right {
            return Err(rejected());
        }
        let (left_summary, right_summary) = match (self.players.get(left), self.players.get(right)) {
            (Some(l), Some(r))
                if l.status() == PlayerStatus::Matchmaking && r.status() == PlayerStatus::Matchmaking =>
            {
                (l.summary(), r.summary())
            }
            _ => return Err(rejected()),
        };

        let id = DuelId::new_v4();
        let (finished_tx, finished_rx) = watch::channel(false);
        let mut seats = Vec::with_capacity(2);

        for (name, opponent, seat) in [
            (left, &right_summary, Seat::Left),
            (right, &left_summary, Seat::Right),
        ] {
            let player = self.players.get_mut(name).ok_or_else(rejected)?;
            player.state = PlayerState::Dueling(DuelLink {
                id,
                opponent: opponent.username.clone(),
                finished: finished_rx.clone(),
            });
            if let Err(e) = player.client.send(ServerMessage::duel_found(seat, opponent.clone())) {
                warn!("Failed to announce duel to {}: {}", name, e);
            }
            seats.push(DuelSeat {
                username: player.username.clone(),
                rank: player.rank,
                connection: player.connection,
                client: player.client.clone(),
                mailbox: player.mailbox.receiver(),
            });
        }

        let right_seat = seats.pop().ok_or_else(rejected)?;
        let left_seat = seats.pop().ok_or_else(rejected)?;
        Ok(DuelPairing::new(id, left_seat, right_seat, finished_tx))
    }

    /// Apply `delta` to a seat's registry entry if that entry is still in `duel`.
    fn adjust_rank(&mut self, seat: &DuelSeat, duel: DuelId, delta: f64) -> f64 {
        match self.players.get_mut(&seat.username) {
            Some(player) if player.connection == seat.connection && player.duel().map(|d| d.id) == Some(duel) => {
                player.rank += delta;
                player.rank
            }
            _ => seat.rank + delta,
        }
    }
}

/// Shared registry of players.
#[derive(Debug)]
pub struct PlayerRegistry {
    state: Mutex<RegistryState>,
    changed: Notify,
    config: LobbyConfig,
}

impl PlayerRegistry {
    /// Create an empty registry.
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            changed: Notify::new(),
            config,
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    /// Resolves at the next membership or status change.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    fn touch(&self) {
        self.changed.notify_waiters();
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Record a live connection.
    pub async fn open_connection(&self, id: ConnectionId) {
        self.state.lock().await.connections.insert(id);
    }

    /// Forget a connection.
    pub async fn close_connection(&self, id: ConnectionId) {
        self.state.lock().await.connections.remove(&id);
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Register a new idle player at the midpoint rank and acknowledge it.
    pub async fn register(&self, username: &str, client: &ClientSender) -> Result<PlayerSummary, LobbyError> {
        self.register_checked(username, client, false).await
    }

    /// Like `register`, for a connection that may already own a player.
    ///
    /// Checks run in order: name taken, connection already registered,
    /// name too long.
    pub async fn register_checked(
        &self,
        username: &str,
        client: &ClientSender,
        connection_owns_player: bool,
    ) -> Result<PlayerSummary, LobbyError> {
        let mut state = self.state.lock().await;
        if state.players.contains_key(username) {
            return Err(LobbyError::AlreadyExists(username.to_string()));
        }
        if connection_owns_player {
            return Err(LobbyError::AlreadyRegistered);
        }
        let max = self.config.max_username_len;
        if username.chars().count() > max {
            return Err(LobbyError::InvalidUsername { max });
        }

        let player = Player::new(
            username.to_string(),
            self.config.starting_rank(),
            client.clone(),
            self.config.mailbox_capacity,
        );
        let summary = player.summary();
        if let Err(e) = client.send(ServerMessage::NewPlayerSuccess {
            data: NewPlayerAck { username: username.to_string() },
        }) {
            warn!("Failed to acknowledge registration of {}: {}", username, e);
        }
        state.players.insert(username.to_string(), player);
        drop(state);

        self.touch();
        info!("Player {} registered on connection {}", username, client.id());
        Ok(summary)
    }

    /// Remove a player, provided `connection` still owns it.
    pub async fn remove(&self, username: &str, connection: ConnectionId) -> Option<Departure> {
        let mut state = self.state.lock().await;
        state.owned(username, connection).ok()?;
        let player = state.players.remove(username)?;
        drop(state);

        let resignation = player.duel().map(|link| {
            info!("Player {} leaves duel {} against {}", username, link.id, link.opponent);
            DuelTicket {
                duel: link.id,
                mailbox: player.mailbox.sender(),
                finished: link.finished.clone(),
            }
        });
        self.touch();
        info!("Player {} removed from registry", username);

        Some(Departure { player: player.snapshot(), resignation })
    }

    /// Look up one player.
    pub async fn lookup(&self, username: &str) -> Option<PlayerSnapshot> {
        self.state.lock().await.players.get(username).map(Player::snapshot)
    }

    /// Every registered player, in username order.
    pub async fn snapshot(&self) -> Vec<PlayerSnapshot> {
        self.state.lock().await.players.values().map(Player::snapshot).collect()
    }

    /// Number of registered players.
    pub async fn len(&self) -> usize {
        self.state.lock().await.players.len()
    }

    /// Whether nobody is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Hold the lock and look at every player (used for fan-out).
    pub async fn view(&self) -> RegistryView<'_> {
        RegistryView { guard: self.state.lock().await }
    }

    // -------------------------------------------------------------------------
    // Status transitions
    // -------------------------------------------------------------------------

    /// Idle -> Matchmaking, acknowledged with a `searching` status.
    pub async fn begin_matchmaking(&self, username: &str, connection: ConnectionId) -> Result<(), LobbyError> {
        let mut state = self.state.lock().await;
        let player = state.owned_mut(username, connection)?;
        if player.status() != PlayerStatus::Idle {
            return Err(LobbyError::AlreadyInDuel);
        }
        player.state = PlayerState::Matchmaking;
        if let Err(e) = player.client.send(ServerMessage::searching()) {
            warn!("Failed to acknowledge search of {}: {}", username, e);
        }
        drop(state);

        self.touch();
        debug!("Player {} is matchmaking", username);
        Ok(())
    }

    /// Ticket for forwarding a duel message from `username`'s connection.
    pub async fn duel_ticket(&self, username: &str, connection: ConnectionId) -> Result<DuelTicket, LobbyError> {
        let state = self.state.lock().await;
        let player = state.owned(username, connection)?;
        let link = player.duel().ok_or(LobbyError::NotDueling)?;
        Ok(DuelTicket {
            duel: link.id,
            mailbox: player.mailbox.sender(),
            finished: link.finished.clone(),
        })
    }

    /// Scan for the closest-ranked opponent and, if there is one, pair with it.
    pub async fn try_pair(&self, username: &str, connection: ConnectionId) -> PairAttempt {
        let mut state = self.state.lock().await;
        let opponent = match state.owned(username, connection) {
            Ok(seeker) if seeker.status() == PlayerStatus::Matchmaking => {
                match closest_opponent(seeker, state.players.values()) {
                    Some(opponent) => opponent.username.clone(),
                    None => return PairAttempt::Pending,
                }
            }
            _ => return PairAttempt::Abandoned,
        };

        match state.pair(username, &opponent) {
            Ok(pairing) => {
                drop(state);
                self.touch();
                PairAttempt::Paired(pairing)
            }
            Err(e) => {
                warn!("Pairing rejected: {}", e);
                PairAttempt::Pending
            }
        }
    }

    /// Pair two specific players. Refused unless both are matchmaking.
    pub async fn pair(&self, left: &str, right: &str) -> Result<DuelPairing, PairingRejected> {
        let pairing = self.state.lock().await.pair(left, right)?;
        self.touch();
        Ok(pairing)
    }

    /// Apply +1 to the winner and -1 to the loser in one critical section.
    ///
    /// Entries that left `duel` (signed out, possibly re-registered under the
    /// same name) keep their rank; the outcome reports the seat's rank moved.
    pub async fn resolve_duel(&self, duel: DuelId, winner: &DuelSeat, loser: &DuelSeat) -> DuelOutcome {
        let mut state = self.state.lock().await;
        let winner_rank = state.adjust_rank(winner, duel, 1.0);
        let loser_rank = state.adjust_rank(loser, duel, -1.0);
        drop(state);

        info!(
            "Duel resolved: {} wins ({}), {} loses ({})",
            winner.username, winner_rank, loser.username, loser_rank
        );
        DuelOutcome {
            winner: winner.username.clone(),
            winner_rank,
            loser: loser.username.clone(),
            loser_rank,
        }
    }

    /// Dueling -> Idle, if the player is still in duel `duel`.
    pub async fn finish_duel(&self, username: &str, connection: ConnectionId, duel: DuelId) -> bool {
        let mut state = self.state.lock().await;
        let finished = match state.owned_mut(username, connection) {
            Ok(player) if player.duel().map(|d| d.id) == Some(duel) => {
                player.state = PlayerState::Idle;
                true
            }
            _ => false,
        };
        drop(state);

        if finished {
            self.touch();
        }
        finished
    }
}

/// Locked, read-only view of the registry.
pub struct RegistryView<'a> {
    guard: MutexGuard<'a, RegistryState>,
}

impl RegistryView<'_> {
    /// Registered players in username order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.guard.players.values()
    }
}
