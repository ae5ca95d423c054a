//! Duel Session Management
//!
//! A duel pairs two players. Each side gets a relay task made of two loops:
//!
//! - the forwarder drains the side's mailbox and pushes game state into the
//!   opponent's inbound channel. A terminal message (`game-end` or a
//!   resignation) is pushed into both inbound channels and stops it.
//! - the deliverer reads the side's inbound channel, writes game state to the
//!   client, and on the terminal message resolves the duel and reports the
//!   result.
//!
//! The duel is over once both relays have exited.

use std::sync::Arc;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::lobby::broadcast::broadcast_players;
use crate::lobby::player::{DuelId, DuelMessage, DuelPayload, MailboxReceiver};
use crate::lobby::registry::{LobbyError, PlayerRegistry};
use crate::network::outbound::{ClientSender, ConnectionId};
use crate::network::protocol::{DuelResult, ServerMessage, GAME_END};

/// One participant, as seen by the duel.
#[derive(Debug, Clone)]
pub struct DuelSeat {
    /// Player name.
    pub username: String,
    /// Rank when the duel started.
    pub rank: f64,
    /// Connection that owned the player at pairing time.
    pub connection: ConnectionId,
    /// Writer for the player's connection.
    pub client: ClientSender,
    /// The player's duel mailbox.
    pub mailbox: MailboxReceiver,
}

/// Two players just moved to Dueling, not yet running.
#[derive(Debug)]
pub struct DuelPairing {
    /// Duel identifier.
    pub id: DuelId,
    /// Seeker, seated left.
    pub left: DuelSeat,
    /// Opponent, seated right.
    pub right: DuelSeat,
    finished: watch::Sender<bool>,
}

impl DuelPairing {
    pub(crate) fn new(id: DuelId, left: DuelSeat, right: DuelSeat, finished: watch::Sender<bool>) -> Self {
        Self { id, left, right, finished }
    }

    /// Declare the duel over without running it.
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }
}

/// Result of rank resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DuelOutcome {
    /// Winner's username.
    pub winner: String,
    /// Winner's rank afterwards.
    pub winner_rank: f64,
    /// Loser's username.
    pub loser: String,
    /// Loser's rank afterwards.
    pub loser_rank: f64,
}

impl DuelOutcome {
    /// `game-end` body for one participant.
    pub fn result_for(&self, username: &str) -> DuelResult {
        let new_rank = if username == self.winner {
            self.winner_rank
        } else {
            self.loser_rank
        };
        DuelResult {
            result: self.winner.clone(),
            new_rank,
        }
    }
}

/// What travels between the two relays.
#[derive(Debug, Clone)]
enum Relayed {
    State(Value),
    End { winner: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Both relay tasks; aborted together if the owner goes away early.
struct RelayTasks([JoinHandle<()>; 2]);

impl RelayTasks {
    async fn join(mut self, id: DuelId) {
        for handle in self.0.iter_mut() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Relay of duel {} failed: {}", id, e);
                }
            }
        }
    }
}

impl Drop for RelayTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// A running duel.
pub struct DuelSession {
    id: DuelId,
    seats: [DuelSeat; 2],
    finished: watch::Sender<bool>,
    outcome: OnceCell<DuelOutcome>,
    registry: Arc<PlayerRegistry>,
}

impl DuelSession {
    /// Wrap a pairing.
    pub fn new(pairing: DuelPairing, registry: Arc<PlayerRegistry>) -> Self {
        Self {
            id: pairing.id,
            seats: [pairing.left, pairing.right],
            finished: pairing.finished,
            outcome: OnceCell::new(),
            registry,
        }
    }

    /// Duel identifier.
    pub fn id(&self) -> DuelId {
        self.id
    }

    /// Run both relays to completion, then broadcast the new standings.
    #[instrument(skip(self), fields(duel = %self.id))]
    pub async fn run(self) -> Option<DuelOutcome> {
        let session = Arc::new(self);
        info!("{} is dueling {}", session.seats[0].username, session.seats[1].username);

        let (to_left_tx, to_left_rx) = mpsc::unbounded_channel();
        let (to_right_tx, to_right_rx) = mpsc::unbounded_channel();

        let relays = RelayTasks([
            tokio::spawn(session.clone().relay(Side::Left, to_left_rx, to_right_tx.clone(), to_left_tx.clone())),
            tokio::spawn(session.clone().relay(Side::Right, to_right_rx, to_left_tx, to_right_tx)),
        ]);
        relays.join(session.id).await;

        session.finished.send_replace(true);
        info!("Duel {} finished", session.id);

        // Failures are logged by the broadcast itself.
        let _ = broadcast_players(&session.registry).await;
        session.outcome.get().cloned()
    }

    fn seat(&self, side: Side) -> &DuelSeat {
        &self.seats[side.index()]
    }

    async fn relay(
        self: Arc<Self>,
        side: Side,
        mut inbound: UnboundedReceiver<Relayed>,
        to_opponent: UnboundedSender<Relayed>,
        to_self: UnboundedSender<Relayed>,
    ) {
        let seat = self.seat(side);
        {
            let forward = self.forward_mailbox(side, to_opponent, to_self);
            tokio::pin!(forward);
            let mut forwarding = true;

            loop {
                tokio::select! {
                    _ = &mut forward, if forwarding => forwarding = false,
                    relayed = inbound.recv() => match relayed {
                        Some(Relayed::State(data)) => {
                            if let Err(e) = seat.client.send(ServerMessage::GameState { data }) {
                                warn!("Dropped game state for {}: {}", seat.username, e);
                            }
                        }
                        Some(Relayed::End { winner }) => {
                            let outcome = self.resolve(&winner).await;
                            let result = outcome.result_for(&seat.username);
                            if let Err(e) = seat.client.send(ServerMessage::GameEnd(result)) {
                                warn!("Failed to send duel result to {}: {}", seat.username, e);
                            }
                            break;
                        }
                        None => break,
                    },
                }
            }
        }

        self.registry.finish_duel(&seat.username, seat.connection, self.id).await;
        debug!("Relay for {} exited", seat.username);
    }

    /// Drain `side`'s mailbox until a terminal message.
    async fn forward_mailbox(&self, side: Side, to_opponent: UnboundedSender<Relayed>, to_self: UnboundedSender<Relayed>) {
        let seat = self.seat(side);
        let opponent = self.seat(side.other());
        let mut mailbox = seat.mailbox.lock().await;

        loop {
            // Every sender gone means the player record is gone too.
            let message = mailbox.recv().await.unwrap_or(DuelMessage {
                duel: self.id,
                payload: DuelPayload::Resign,
            });
            if message.duel != self.id {
                debug!("Dropping message for duel {} from {}", message.duel, seat.username);
                continue;
            }

            let winner = match message.payload {
                DuelPayload::State(data) => {
                    let _ = to_opponent.send(Relayed::State(data));
                    continue;
                }
                DuelPayload::End { player_won } => {
                    if player_won != seat.username && player_won != opponent.username {
                        let reply = ServerMessage::error(GAME_END, LobbyError::InvalidWinner.to_string());
                        if let Err(e) = seat.client.send(reply) {
                            warn!("Failed to reject game-end from {}: {}", seat.username, e);
                        }
                        continue;
                    }
                    player_won
                }
                DuelPayload::Resign => {
                    info!("{} resigned against {}", seat.username, opponent.username);
                    opponent.username.clone()
                }
            };

            let end = Relayed::End { winner };
            let _ = to_opponent.send(end.clone());
            let _ = to_self.send(end);
            return;
        }
    }

    /// Resolve ranks once; later callers get the same outcome.
    async fn resolve(&self, declared_winner: &str) -> &DuelOutcome {
        self.outcome
            .get_or_init(|| async {
                let (winner, loser) = if declared_winner == self.seats[0].username {
                    (&self.seats[0], &self.seats[1])
                } else {
                    (&self.seats[1], &self.seats[0])
                };
                self.registry.resolve_duel(self.id, winner, loser).await
            })
            .await
    }
}
