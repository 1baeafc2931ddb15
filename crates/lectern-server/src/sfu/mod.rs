//! Session and media-resource orchestration
//!
//! Turns the media engine's primitives into per-class sessions: participant
//! tracking, transport/producer/consumer lifecycles with conflict retry and
//! grace-period cleanup, and permission fan-out.

mod cleanup;
mod presence;
mod resources;
mod session;

pub use session::{ClassSession, Participant, ProducerState, SessionRegistry};
