//! Player list broadcast.
//!
//! Pushes the full standings to every registered player whenever membership or
//! ranks change. The whole fan-out happens under the registry lock so the list
//! and the set of recipients are the same membership.

use tracing::{debug, warn};

use crate::lobby::registry::PlayerRegistry;
use crate::network::outbound::TransportError;
use crate::network::protocol::{PlayerSummary, ServerMessage};

/// Sort players by rank, highest first. Equal ranks keep their input order.
pub fn standings(mut players: Vec<PlayerSummary>) -> Vec<PlayerSummary> {
    players.sort_by(|a, b| b.rank.total_cmp(&a.rank));
    players
}

/// Send `players-update` to every registered player.
///
/// Stops at the first failed write; messages already queued stay queued.
/// Returns how many players were sent the update.
pub async fn broadcast_players(registry: &PlayerRegistry) -> Result<usize, TransportError> {
    let view = registry.view().await;
    let players = standings(view.players().map(|p| p.summary()).collect());
    let update = ServerMessage::PlayersUpdate { players };

    let mut sent = 0;
    for player in view.players() {
        if let Err(e) = player.client.send(update.clone()) {
            warn!("Broadcast to {} failed, aborting fan-out: {}", player.username, e);
            return Err(e);
        }
        sent += 1;
    }
    debug!("Broadcast player list to {} players", sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::LobbyConfig;
    use crate::network::outbound::ClientSender;
    use proptest::prelude::*;

    fn summary(name: &str, rank: f64) -> PlayerSummary {
        PlayerSummary { username: name.to_string(), rank }
    }

    #[test]
    fn test_standings_descending() {
        let sorted = standings(vec![summary("a", 4.0), summary("b", 7.0), summary("c", -1.0)]);
        let names: Vec<_> = sorted.iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_player() {
        let registry = PlayerRegistry::new(LobbyConfig::default());
        let (alice, mut alice_rx) = ClientSender::channel(1, 8);
        let (bob, mut bob_rx) = ClientSender::channel(2, 8);
        registry.register("alice", &alice).await.unwrap();
        registry.register("bob", &bob).await.unwrap();
        alice_rx.recv().await;
        bob_rx.recv().await;

        assert_eq!(broadcast_players(&registry).await, Ok(2));

        let expected = ServerMessage::PlayersUpdate {
            players: vec![summary("alice", 5.0), summary("bob", 5.0)],
        };
        assert_eq!(alice_rx.recv().await, Some(expected.clone()));
        assert_eq!(bob_rx.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn test_broadcast_aborts_on_write_failure() {
        let registry = PlayerRegistry::new(LobbyConfig::default());
        let (alice, alice_rx) = ClientSender::channel(1, 8);
        let (bob, mut bob_rx) = ClientSender::channel(2, 8);
        registry.register("alice", &alice).await.unwrap();
        registry.register("bob", &bob).await.unwrap();
        bob_rx.recv().await;
        drop(alice_rx);

        // "alice" sorts first in the registry, so nobody gets the update.
        assert_eq!(broadcast_players(&registry).await, Err(TransportError::Closed(1)));
        assert!(bob_rx.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn prop_standings_sorted_and_complete(ranks in proptest::collection::vec(-50.0f64..50.0, 0..32)) {
            let input: Vec<_> = ranks.iter().enumerate()
                .map(|(i, r)| summary(&format!("p{}", i), *r))
                .collect();
            let sorted = standings(input.clone());

            prop_assert_eq!(sorted.len(), input.len());
            prop_assert!(sorted.windows(2).all(|w| w[0].rank >= w[1].rank));
            for player in &input {
                prop_assert!(sorted.contains(player));
            }
        }
    }
}
