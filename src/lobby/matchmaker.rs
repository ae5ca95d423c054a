//! Matchmaking
//!
//! One search task per player that asked for a duel. Each pass scans the
//! registry under its lock for the matchmaking player with the closest rank and
//! pairs with it in the same critical section. Between passes the task sleeps
//! until the registry changes or the fallback tick elapses.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::lobby::player::{Player, PlayerStatus};
use crate::lobby::registry::PairAttempt;
use crate::lobby::Lobby;
use crate::network::outbound::ConnectionId;

/// Best opponent for `seeker` among `candidates`.
///
/// Only other players that are matchmaking qualify. The smallest absolute rank
/// difference wins; on a tie the first candidate seen is kept.
pub fn closest_opponent<'a, I>(seeker: &Player, candidates: I) -> Option<&'a Player>
where
    I: IntoIterator<Item = &'a Player>,
{
    let mut best: Option<(&'a Player, f64)> = None;
    for candidate in candidates {
        if candidate.username == seeker.username || candidate.status() != PlayerStatus::Matchmaking {
            continue;
        }
        let diff = (seeker.rank - candidate.rank).abs();
        if best.map_or(true, |(_, best_diff)| diff < best_diff) {
            best = Some((candidate, diff));
        }
    }
    best.map(|(player, _)| player)
}

/// Search until paired, or until the player stops matchmaking.
///
/// A successful pairing is handed to the lobby as a new duel; the search
/// itself ends right there.
#[instrument(skip(lobby))]
pub async fn search(lobby: Arc<Lobby>, username: String, connection: ConnectionId) {
    let registry = lobby.registry().clone();
    let tick = registry.config().matchmaking_tick;

    loop {
        // Register interest before scanning so a change during the scan wakes us.
        let changed = registry.changed();
        tokio::pin!(changed);
        changed.as_mut().enable();

        match registry.try_pair(&username, connection).await {
            PairAttempt::Paired(pairing) => {
                debug!("{} paired with {}", pairing.left.username, pairing.right.username);
                lobby.spawn_duel(pairing);
                return;
            }
            PairAttempt::Abandoned => {
                debug!("Search for {} abandoned", username);
                return;
            }
            PairAttempt::Pending => {}
        }

        tokio::select! {
            _ = &mut changed => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }
}
