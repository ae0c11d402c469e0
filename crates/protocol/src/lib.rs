//! Tether Protocol
//!
//! Shared types for communication between the relay, workstations, viewers
//! and session runners. These types are serialized as JSON — one message per
//! websocket frame on the relay link, one message per line on the local
//! runner socket.

use uuid::Uuid;

pub mod client;
pub mod runner;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use runner::{ManagerMessage, RunnerMessage};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
