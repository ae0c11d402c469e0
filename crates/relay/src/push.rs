//! Push notification dispatch.
//!
//! The push gateway itself (APNs/FCM plumbing) is external; the relay
//! drives it through this trait, fire-and-forget. Delivery failures are
//! the gateway's to log.

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Idle,
    Ended,
}

#[derive(Debug, Clone)]
pub struct PushNotification {
    pub session_id: String,
    pub session_name: String,
    pub kind: PushKind,
}

pub trait PushGateway: Send + Sync {
    /// Dispatch a notification to a user's registered device tokens.
    fn dispatch(&self, user: &str, tokens: &[String], notification: PushNotification);
}

/// Default gateway: logs instead of delivering.
pub struct LogPushGateway;

impl PushGateway for LogPushGateway {
    fn dispatch(&self, user: &str, tokens: &[String], notification: PushNotification) {
        info!(
            component = "push",
            event = "push.dispatched",
            user = %user,
            device_tokens = tokens.len(),
            session_id = %notification.session_id,
            kind = ?notification.kind,
            "Push dispatched"
        );
    }
}
