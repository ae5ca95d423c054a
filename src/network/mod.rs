//! Network Layer
//!
//! WebSocket server, wire protocol and per-connection sessions.
//! Nothing here owns game rules; requests are validated against the lobby.

pub mod outbound;
pub mod protocol;
pub mod session;
pub mod server;

pub use outbound::{ClientSender, ConnectionId, TransportError};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use session::ClientSession;
pub use server::{DuelServer, DuelServerError, ServerConfig};
