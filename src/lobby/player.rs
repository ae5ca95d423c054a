//! Player Records
//!
//! Live state of one registered participant, plus the duel mailbox that carries
//! duel-scoped messages from the player's connection to the running duel.

use std::sync::Arc;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};

use crate::network::outbound::{ClientSender, ConnectionId};
use crate::network::protocol::PlayerSummary;

/// Unique duel identifier.
pub type DuelId = uuid::Uuid;

/// Coarse player status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    /// Registered, doing nothing.
    Idle,
    /// Waiting for an opponent.
    Matchmaking,
    /// Paired in a live duel.
    Dueling,
}

/// Link from a dueling player to its duel.
#[derive(Debug, Clone)]
pub struct DuelLink {
    /// Duel identifier.
    pub id: DuelId,
    /// Opponent username.
    pub opponent: String,
    /// Flips to `true` once both relays of the duel have exited.
    pub finished: watch::Receiver<bool>,
}

/// Full player state. `Dueling` carries its duel so the two cannot disagree.
#[derive(Debug, Clone)]
pub(crate) enum PlayerState {
    Idle,
    Matchmaking,
    Dueling(DuelLink),
}

/// Duel-scoped message from a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum DuelPayload {
    /// Opaque game state for the opponent.
    State(Value),
    /// Declared end of the duel.
    End {
        /// Declared winner.
        player_won: String,
    },
    /// Player left (sign-out or disconnect); the opponent wins.
    Resign,
}

/// Mailbox entry, stamped with the duel it was sent for.
#[derive(Debug, Clone, PartialEq)]
pub struct DuelMessage {
    /// Duel the sender believed it was in.
    pub duel: DuelId,
    /// Content.
    pub payload: DuelPayload,
}

/// Consumer side of a mailbox. Held by the relay of whichever duel is running.
pub type MailboxReceiver = Arc<Mutex<mpsc::Receiver<DuelMessage>>>;

/// Bounded, ordered channel from a connection to its player's duel relay.
///
/// A send blocks while the mailbox is full, so a second duel message sent before
/// the first is drained holds up the connection's read loop.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<DuelMessage>,
    rx: MailboxReceiver,
}

impl Mailbox {
    /// Create a mailbox holding at most `capacity` undrained messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx: Arc::new(Mutex::new(rx)) }
    }

    /// Producer handle.
    pub fn sender(&self) -> mpsc::Sender<DuelMessage> {
        self.tx.clone()
    }

    /// Consumer handle.
    pub fn receiver(&self) -> MailboxReceiver {
        self.rx.clone()
    }
}

/// A registered player.
#[derive(Debug)]
pub struct Player {
    /// Unique display name.
    pub username: String,
    /// Score; only duel resolution changes it.
    pub rank: f64,
    pub(crate) state: PlayerState,
    /// Owning connection. The player does not control its lifetime.
    pub connection: ConnectionId,
    pub(crate) client: ClientSender,
    pub(crate) mailbox: Mailbox,
}

impl Player {
    /// Create an idle player.
    pub fn new(username: String, rank: f64, client: ClientSender, mailbox_capacity: usize) -> Self {
        Self {
            username,
            rank,
            state: PlayerState::Idle,
            connection: client.id(),
            client,
            mailbox: Mailbox::new(mailbox_capacity),
        }
    }

    /// Current status flag.
    pub fn status(&self) -> PlayerStatus {
        match self.state {
            PlayerState::Idle => PlayerStatus::Idle,
            PlayerState::Matchmaking => PlayerStatus::Matchmaking,
            PlayerState::Dueling(_) => PlayerStatus::Dueling,
        }
    }

    /// Running duel, if any.
    pub fn duel(&self) -> Option<&DuelLink> {
        match &self.state {
            PlayerState::Dueling(link) => Some(link),
            _ => None,
        }
    }

    /// Name and rank, as shown to clients.
    pub fn summary(&self) -> PlayerSummary {
        PlayerSummary {
            username: self.username.clone(),
            rank: self.rank,
        }
    }

    /// Read-only copy of the interesting fields.
    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            username: self.username.clone(),
            rank: self.rank,
            status: self.status(),
            connection: self.connection,
        }
    }
}

/// Point-in-time view of a player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    /// Player name.
    pub username: String,
    /// Rank at snapshot time.
    pub rank: f64,
    /// Status at snapshot time.
    pub status: PlayerStatus,
    /// Owning connection.
    pub connection: ConnectionId,
}
