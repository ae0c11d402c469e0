//! Client → Server messages
//!
//! Both connection roles (workstation and viewer) speak this enum; the
//! relay enforces which variants a role may send after authentication.

use serde::{Deserialize, Serialize};

use crate::types::{Role, SessionStatus, TodoItem};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection. The server closes on failure.
    Auth {
        token: String,
    },

    // Workstation → server: session lifecycle and output events
    SessionStart {
        session_id: String,
        name: String,
        cwd: String,
    },
    SessionUpdate {
        session_id: String,
        name: String,
    },
    SessionTodos {
        session_id: String,
        todos: Vec<TodoItem>,
    },
    SessionMessage {
        session_id: String,
        role: Role,
        content: String,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    SessionEnd {
        session_id: String,
    },

    // Viewer → server
    ListSessions,
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    SendInput {
        session_id: String,
        text: String,
    },
    TrackSession {
        session_id: String,
    },
    UntrackSession {
        session_id: String,
    },
    RegisterPushToken {
        push_token: String,
    },
}
