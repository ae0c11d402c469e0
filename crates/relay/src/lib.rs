//! Tether Relay
//!
//! Process-global fan-out hub between workstations and remote viewers.
//! Workstations announce sessions and stream output events; viewers
//! subscribe per session, receive a replay of recent history, and send
//! input back to the owning workstation. Authentication, per-session
//! access control, device-code pairing and idle-aware push dispatch all
//! live here.

mod auth;
mod http;
mod pairing;
mod push;
mod registry;
mod ws;

pub use auth::{Principal, TokenRole, TokenStore};
pub use http::router;
pub use pairing::{PairingStore, PollOutcome};
pub use push::{LogPushGateway, PushGateway, PushKind, PushNotification};
pub use registry::{RelayConfig, RelayError, RelayState};
