//! Lectern Protocol
//!
//! Shared wire types for the Lectern signaling protocol: the messages
//! exchanged over the per-participant WebSocket and the data types they carry.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::*;
