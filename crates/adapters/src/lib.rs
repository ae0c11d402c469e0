//! Tether Chat Adapters
//!
//! The adapter contract: a thin consumer of session-manager events that
//! owns one remote channel or chat. The platform SDK (posting, markdown,
//! archiving) stays behind the [`ChatPort`] trait; this crate owns the
//! behavior that must be identical across platforms — echo suppression,
//! outbound chunking, image attachment, rate limiting.

mod adapter;
mod chunk;
mod images;
mod ledger;

pub use adapter::{AdapterConfig, ChatAdapter, ChatPort, PortError};
pub use chunk::chunk_text;
pub use images::scan_image_paths;
pub use ledger::EchoLedger;
