//! Outbound message queue for one connection.
//!
//! Everything written to a client goes through a bounded channel drained by the
//! connection's writer task. Sends never wait: a full or closed queue is a
//! write failure, so nothing holding the registry lock ever blocks on a socket.

use tokio::sync::mpsc;

use crate::network::protocol::ServerMessage;

/// Identifier of one live connection.
pub type ConnectionId = u64;

/// Write failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Writer task is gone (connection closed).
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// Client is not draining its queue.
    #[error("outbound queue of connection {0} is full")]
    Full(ConnectionId),
}

/// Cloneable handle for writing to one client.
#[derive(Debug, Clone)]
pub struct ClientSender {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientSender {
    /// Create a sender and the receiving end for the writer task.
    pub fn channel(id: ConnectionId, buffer: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { id, tx }, rx)
    }

    /// Connection this sender writes to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message for the client.
    pub fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(self.id),
        })
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
