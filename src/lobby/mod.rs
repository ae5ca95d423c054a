//! Lobby
//!
//! Everything that lives between connections: the player registry, the
//! matchmaking searches, the player-list broadcast, and ownership of every
//! running duel task.
//!
//! ## Module Structure
//!
//! - `player`: player records, status, duel mailbox
//! - `registry`: the locked player directory
//! - `matchmaker`: per-player opponent search
//! - `broadcast`: `players-update` fan-out

pub mod broadcast;
pub mod matchmaker;
pub mod player;
pub mod registry;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::duel::{DuelPairing, DuelSession};
use crate::network::outbound::{ConnectionId, TransportError};

pub use player::{DuelId, DuelPayload, Player, PlayerSnapshot, PlayerStatus};
pub use registry::{LobbyError, PairAttempt, PlayerRegistry};

/// Lobby configuration.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Width of the rank scale; new players start in the middle.
    pub rank_range: f64,
    /// Longest accepted username, in characters.
    pub max_username_len: usize,
    /// Undrained duel messages a player may have in flight.
    pub mailbox_capacity: usize,
    /// Fallback rescan period for a pending search.
    pub matchmaking_tick: Duration,
    /// How long shutdown waits for running duels.
    pub shutdown_grace: Duration,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            rank_range: 10.0,
            max_username_len: 15,
            mailbox_capacity: 1,
            matchmaking_tick: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl LobbyConfig {
    /// Rank given to a new player.
    pub fn starting_rank(&self) -> f64 {
        self.rank_range / 2.0
    }
}

/// Shared lobby context.
pub struct Lobby {
    registry: Arc<PlayerRegistry>,
    duels: Mutex<JoinSet<()>>,
}

impl Lobby {
    /// Create an empty lobby.
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            registry: Arc::new(PlayerRegistry::new(config)),
            duels: Mutex::new(JoinSet::new()),
        }
    }

    /// Player registry.
    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.registry
    }

    /// Start an opponent search for a player that just entered matchmaking.
    pub fn start_search(self: &Arc<Self>, username: String, connection: ConnectionId) -> JoinHandle<()> {
        tokio::spawn(matchmaker::search(self.clone(), username, connection))
    }

    /// Run a freshly paired duel. The lobby owns the task until it finishes.
    ///
    /// Must not await: the calling search may be aborted at any await point,
    /// and the pairing has to be owned here before that can happen.
    pub fn spawn_duel(&self, pairing: DuelPairing) {
        let duel = DuelSession::new(pairing, self.registry.clone());
        let mut duels = self.duels.lock().unwrap_or_else(PoisonError::into_inner);
        while duels.try_join_next().is_some() {}
        duels.spawn(async move {
            duel.run().await;
        });
    }

    /// Number of duels still running.
    pub fn active_duels(&self) -> usize {
        let mut duels = self.duels.lock().unwrap_or_else(PoisonError::into_inner);
        while duels.try_join_next().is_some() {}
        duels.len()
    }

    /// Send the current standings to every registered player.
    pub async fn broadcast_players(&self) -> Result<usize, TransportError> {
        broadcast::broadcast_players(&self.registry).await
    }

    /// Wait for running duels, aborting whatever outlives the grace period.
    pub async fn shutdown(&self) {
        let mut duels = {
            let mut guard = self.duels.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        if duels.is_empty() {
            return;
        }

        info!("Waiting for {} duels to finish", duels.len());
        let grace = self.registry.config().shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while duels.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} duels still running after {:?}", duels.len(), grace);
            duels.shutdown().await;
        }
    }
}
