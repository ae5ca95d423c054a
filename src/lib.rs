//! # Duel Arena Server
//!
//! Real-time matchmaking and one-on-one duel relay over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DUEL ARENA SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/        - Transport                                 │
//! │  ├── server.rs   - Accept loop, upgrade, shutdown            │
//! │  ├── session.rs  - Per-connection request dispatch           │
//! │  ├── protocol.rs - JSON message types                        │
//! │  └── outbound.rs - Non-blocking client writer                │
//! │                                                              │
//! │  lobby/          - Shared state                              │
//! │  ├── registry.rs - Locked player directory                   │
//! │  ├── player.rs   - Player records and duel mailbox           │
//! │  ├── matchmaker.rs - Closest-rank opponent search            │
//! │  └── broadcast.rs  - Player list fan-out                     │
//! │                                                              │
//! │  duel/           - Running duels                             │
//! │  └── session.rs  - Two-sided relay and rank resolution       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Player membership, status and rank only change under the registry lock.
//! A player is in at most one duel, and a duel changes ranks exactly once:
//! +1 for the winner, -1 for the loser.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod duel;
pub mod lobby;
pub mod network;

// Re-export commonly used types
pub use duel::{DuelOutcome, DuelSession};
pub use lobby::{Lobby, LobbyConfig, LobbyError, PlayerRegistry, PlayerStatus};
pub use network::{DuelServer, DuelServerError, ServerConfig, ServerMessage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
