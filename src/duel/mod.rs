//! Duels
//!
//! Running one-on-one matches: message relay between the two participants and
//! exactly-once rank resolution at the end.

pub mod session;

pub use session::{DuelOutcome, DuelPairing, DuelSeat, DuelSession};
