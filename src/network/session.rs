//! Client Session Management
//!
//! One `ClientSession` per WebSocket connection. It decodes inbound frames,
//! validates them against the lobby and either mutates the registry or hands
//! the message to the player's running duel. It owns at most one player and at
//! most one matchmaking search.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lobby::{DuelPayload, Lobby, LobbyError};
use crate::network::outbound::{ClientSender, ConnectionId};
use crate::network::protocol::{ClientMessage, GameEndData, ServerMessage};

/// State of one connected client.
pub struct ClientSession {
    id: ConnectionId,
    lobby: Arc<Lobby>,
    client: ClientSender,
    /// Player registered through this connection.
    player: Option<String>,
    /// Running opponent search, if any.
    search: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Create a session for a freshly accepted connection.
    pub fn new(lobby: Arc<Lobby>, client: ClientSender) -> Self {
        Self {
            id: client.id(),
            lobby,
            client,
            player: None,
            search: None,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Username owned by this session.
    pub fn player(&self) -> Option<&str> {
        self.player.as_deref()
    }

    /// Handle one inbound text frame. Failures are reported to the client.
    pub async fn handle_text(&mut self, text: &str) {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Rejected frame on connection {}: {}", self.id, e);
                self.reply(ServerMessage::error(e.scope(), e.to_string()));
                return;
            }
        };

        let request_type = message.request_type();
        if let Err(e) = self.dispatch(message).await {
            debug!("{} failed on connection {}: {}", request_type, self.id, e);
            self.reply(ServerMessage::error(request_type, e.to_string()));
        }
    }

    /// Apply a decoded request.
    pub async fn dispatch(&mut self, message: ClientMessage) -> Result<(), LobbyError> {
        match message {
            ClientMessage::NewPlayer { username } => self.register(username).await,
            ClientMessage::EnterDuel => self.enter_duel().await,
            ClientMessage::SignOut => self.sign_out().await,
            ClientMessage::GameState(data) => self.forward(DuelPayload::State(data)).await,
            ClientMessage::GameEnd(GameEndData { player_won }) => {
                self.forward(DuelPayload::End { player_won }).await
            }
        }
    }

    /// Tear the session down after the transport closed.
    ///
    /// A player still in a duel resigns it.
    pub async fn close(mut self) {
        self.leave().await;
        self.lobby.registry().close_connection(self.id).await;
        debug!("Session {} closed", self.id);
    }

    fn owned(&self) -> Result<&str, LobbyError> {
        self.player.as_deref().ok_or(LobbyError::NotRegistered)
    }

    async fn register(&mut self, username: String) -> Result<(), LobbyError> {
        self.lobby
            .registry()
            .register_checked(&username, &self.client, self.player.is_some())
            .await?;
        self.player = Some(username);
        self.broadcast().await;
        Ok(())
    }

    async fn enter_duel(&mut self) -> Result<(), LobbyError> {
        let username = self.owned()?.to_string();
        self.lobby.registry().begin_matchmaking(&username, self.id).await?;

        if let Some(previous) = self.search.take() {
            previous.abort();
        }
        self.search = Some(self.lobby.start_search(username, self.id));
        Ok(())
    }

    async fn sign_out(&mut self) -> Result<(), LobbyError> {
        self.owned()?;
        self.leave().await;
        Ok(())
    }

    async fn forward(&self, payload: DuelPayload) -> Result<(), LobbyError> {
        let username = self.owned()?;
        let ticket = self.lobby.registry().duel_ticket(username, self.id).await?;
        ticket.deliver(payload).await
    }

    /// Stop searching, drop the player and resign its duel.
    async fn leave(&mut self) {
        if let Some(search) = self.search.take() {
            search.abort();
        }
        let Some(username) = self.player.take() else {
            return;
        };

        if let Some(departure) = self.lobby.registry().remove(&username, self.id).await {
            if let Some(ticket) = departure.resignation {
                if let Err(e) = ticket.deliver(DuelPayload::Resign).await {
                    debug!("Resignation of {} not delivered: {}", username, e);
                }
            }
        }
        info!("Player {} signed out of connection {}", username, self.id);
        self.broadcast().await;
    }

    async fn broadcast(&self) {
        // Failures are logged by the broadcaster.
        let _ = self.lobby.broadcast_players().await;
    }

    fn reply(&self, message: ServerMessage) {
        if let Err(e) = self.client.send(message) {
            warn!("Reply to connection {} dropped: {}", self.id, e);
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(search) = self.search.take() {
            search.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::{LobbyConfig, PlayerStatus};
    use crate::network::protocol::{DuelResult, MatchmakingStatus, Seat};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn lobby() -> Arc<Lobby> {
        Arc::new(Lobby::new(LobbyConfig::default()))
    }

    fn connect(lobby: &Arc<Lobby>, id: ConnectionId) -> (ClientSession, Receiver<ServerMessage>) {
        let (client, rx) = ClientSender::channel(id, 64);
        (ClientSession::new(lobby.clone(), client), rx)
    }

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn expect(rx: &mut Receiver<ServerMessage>, wanted: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = rx.recv().await.expect("connection closed");
                if wanted(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    fn is_found(msg: &ServerMessage) -> bool {
        matches!(msg, ServerMessage::EnterDuel(s) if s.status == MatchmakingStatus::Found)
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let lobby = lobby();
        let (mut session, mut rx) = connect(&lobby, 1);

        session.handle_text("not json").await;
        session.handle_text(r#"{"request_type":"dance"}"#).await;
        session.handle_text(r#"{"request_type":"new-player","data":{}}"#).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::error("", "Failed to decode JSON"),
                ServerMessage::error("dance", "Unknown request type \"dance\""),
                ServerMessage::error("new-player", "Missing username"),
            ]
        );
        assert!(lobby.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_register_then_duplicate_on_same_connection() {
        let lobby = lobby();
        let (mut session, mut rx) = connect(&lobby, 1);

        session.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        assert_eq!(session.player(), Some("alice"));
        let msgs = drain(&mut rx);
        assert!(matches!(msgs[0], ServerMessage::NewPlayerSuccess { .. }));
        assert!(matches!(msgs[1], ServerMessage::PlayersUpdate { .. }));

        session.handle_text(r#"{"request_type":"new-player","data":{"username":"alice2"}}"#).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::error("new-player", "Player is already registered on connection")]
        );
        assert_eq!(lobby.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_requests_before_registration() {
        let lobby = lobby();
        let (mut session, mut rx) = connect(&lobby, 1);

        session.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        session.handle_text(r#"{"request_type":"sign-out"}"#).await;
        session.handle_text(r#"{"request_type":"game-state","data":{"hp":3}}"#).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::error("enter-duel", "Player is not registered"),
                ServerMessage::error("sign-out", "Player is not registered"),
                ServerMessage::error("game-state", "Player is not registered"),
            ]
        );
    }

    #[tokio::test]
    async fn test_duel_messages_outside_duel() {
        let lobby = lobby();
        let (mut session, mut rx) = connect(&lobby, 1);
        session.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        drain(&mut rx);

        session.handle_text(r#"{"request_type":"game-end","data":{"player_won":"alice"}}"#).await;
        assert_eq!(drain(&mut rx), vec![ServerMessage::error("game-end", "Player is not dueling")]);

        session.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        session.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::searching(),
                ServerMessage::error("enter-duel", "Player already entered duel"),
            ]
        );
    }

    #[tokio::test]
    async fn test_full_duel_between_two_sessions() {
        let lobby = lobby();
        let (mut alice, mut alice_rx) = connect(&lobby, 1);
        let (mut bob, mut bob_rx) = connect(&lobby, 2);
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        bob.handle_text(r#"{"request_type":"new-player","data":{"username":"bob"}}"#).await;

        alice.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        bob.handle_text(r#"{"request_type":"enter-duel"}"#).await;

        let alice_found = expect(&mut alice_rx, is_found).await;
        let bob_found = expect(&mut bob_rx, is_found).await;
        let seats = match (alice_found, bob_found) {
            (ServerMessage::EnterDuel(a), ServerMessage::EnterDuel(b)) => {
                assert_eq!(a.opponent.unwrap().username, "bob");
                assert_eq!(b.opponent.unwrap().username, "alice");
                (a.position.unwrap(), b.position.unwrap())
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(seats == (Seat::Left, Seat::Right) || seats == (Seat::Right, Seat::Left));

        alice.handle_text(r#"{"request_type":"game-state","data":{"x":1}}"#).await;
        let relayed = expect(&mut bob_rx, |m| matches!(m, ServerMessage::GameState { .. })).await;
        assert_eq!(relayed, ServerMessage::GameState { data: serde_json::json!({"x": 1}) });

        bob.handle_text(r#"{"request_type":"game-end","data":{"player_won":"alice"}}"#).await;
        let alice_end = expect(&mut alice_rx, |m| matches!(m, ServerMessage::GameEnd(_))).await;
        let bob_end = expect(&mut bob_rx, |m| matches!(m, ServerMessage::GameEnd(_))).await;
        assert_eq!(alice_end, ServerMessage::GameEnd(DuelResult { result: "alice".to_string(), new_rank: 6.0 }));
        assert_eq!(bob_end, ServerMessage::GameEnd(DuelResult { result: "alice".to_string(), new_rank: 4.0 }));
    }

    #[tokio::test]
    async fn test_disconnect_mid_duel_resigns() {
        let lobby = lobby();
        let (mut alice, _alice_rx) = connect(&lobby, 1);
        let (mut bob, mut bob_rx) = connect(&lobby, 2);
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        bob.handle_text(r#"{"request_type":"new-player","data":{"username":"bob"}}"#).await;
        alice.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        bob.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        expect(&mut bob_rx, is_found).await;

        alice.close().await;

        let bob_end = expect(&mut bob_rx, |m| matches!(m, ServerMessage::GameEnd(_))).await;
        assert_eq!(bob_end, ServerMessage::GameEnd(DuelResult { result: "bob".to_string(), new_rank: 6.0 }));
        assert!(lobby.registry().lookup("alice").await.is_none());

        tokio::time::timeout(Duration::from_secs(2), async {
            while lobby.registry().lookup("bob").await.map(|p| p.status) != Some(PlayerStatus::Idle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reregistered_namesake_keeps_fresh_rank() {
        let lobby = lobby();
        let (mut alice, _alice_rx) = connect(&lobby, 1);
        let (mut bob, mut bob_rx) = connect(&lobby, 2);
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        bob.handle_text(r#"{"request_type":"new-player","data":{"username":"bob"}}"#).await;
        alice.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        bob.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        expect(&mut bob_rx, is_found).await;

        alice.handle_text(r#"{"request_type":"sign-out"}"#).await;
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        assert_eq!(alice.player(), Some("alice"));

        let bob_end = expect(&mut bob_rx, |m| matches!(m, ServerMessage::GameEnd(_))).await;
        assert_eq!(bob_end, ServerMessage::GameEnd(DuelResult { result: "bob".to_string(), new_rank: 6.0 }));

        tokio::time::timeout(Duration::from_secs(2), async {
            while lobby.active_duels() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let fresh = lobby.registry().lookup("alice").await.unwrap();
        assert_eq!(fresh.rank, 5.0);
        assert_eq!(fresh.status, PlayerStatus::Idle);
    }

    #[tokio::test]
    async fn test_taken_name_reported_before_connection_ownership() {
        let lobby = lobby();
        let (mut alice, _alice_rx) = connect(&lobby, 1);
        let (mut bob, mut bob_rx) = connect(&lobby, 2);
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        bob.handle_text(r#"{"request_type":"new-player","data":{"username":"bob"}}"#).await;
        drain(&mut bob_rx);

        bob.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::error("new-player", "Player with username \"alice\" already exists")]
        );
    }

    #[tokio::test]
    async fn test_sign_out_while_searching_stops_search() {
        let lobby = lobby();
        let (mut alice, mut alice_rx) = connect(&lobby, 1);
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        alice.handle_text(r#"{"request_type":"enter-duel"}"#).await;
        alice.handle_text(r#"{"request_type":"sign-out"}"#).await;

        assert_eq!(alice.player(), None);
        assert!(lobby.registry().is_empty().await);
        // The name is free again.
        alice.handle_text(r#"{"request_type":"new-player","data":{"username":"alice"}}"#).await;
        let msgs = drain(&mut alice_rx);
        assert!(msgs.iter().all(|m| !matches!(m, ServerMessage::Error(_))));
        assert_eq!(lobby.active_duels(), 0);
    }
}
