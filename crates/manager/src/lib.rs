//! Tether Session Manager
//!
//! Owns the discovery-and-tailing problem for live AI coding sessions on a
//! workstation. Session runners announce themselves over a local rendezvous
//! socket; for each session the manager finds the matching transcript file,
//! tails it, parses records into typed events and fans them out over a
//! broadcast channel. Input flows the other way: callers hand the manager
//! text, the manager frames it back to the runner which writes it to the PTY.

mod discovery;
mod error;
mod events;
mod manager;
mod rendezvous;
mod session;
mod tailer;
mod transcript;

pub use error::ManagerError;
pub use events::SessionEvent;
pub use manager::{ManagerConfig, SessionManager};
pub use rendezvous::RendezvousServer;
pub use session::SessionAnnounce;
