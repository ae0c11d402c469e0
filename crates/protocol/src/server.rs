//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{Role, SessionStatus, SessionSummary, TodoItem};

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Authentication replies
    AuthOk,
    AuthError {
        message: String,
    },

    // Full state sync — sent to viewers as an authoritative snapshot
    SessionsList {
        sessions: Vec<SessionSummary>,
    },

    // Per-session events, mirrored from the owning workstation
    SessionMessage {
        session_id: String,
        role: Role,
        content: String,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    SessionTodos {
        session_id: String,
        todos: Vec<TodoItem>,
    },
    SessionUpdate {
        session_id: String,
        name: String,
    },

    // Server → workstation: input routed from a viewer
    SendInput {
        session_id: String,
        text: String,
    },

    // Errors
    Error {
        message: String,
    },
}
