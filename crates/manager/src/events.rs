//! Normalized output of the transcript tailer.

use chrono::{DateTime, Utc};
use serde_json::Value;

use tether_protocol::{Role, SessionMode, SessionStatus, TodoItem};

/// Typed events emitted by the session manager, in transcript order per
/// session. Consumers receive them over a broadcast channel and must not
/// block: a lagging receiver is skipped, not waited on.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A runner announced a new session.
    Started { id: String, name: String, cwd: String },

    /// The transcript revealed the session slug. Fires at most once.
    Renamed { id: String, name: String },

    /// A conversational message from the transcript.
    Message {
        id: String,
        role: Role,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// The task list changed.
    TodoList { id: String, todos: Vec<TodoItem> },

    /// The assistant invoked a tool.
    ToolCall {
        id: String,
        call_id: String,
        name: String,
        input: Value,
    },

    /// A tool produced output.
    ToolResult {
        id: String,
        call_id: String,
        text: String,
        is_error: bool,
    },

    /// Plan-mode transition. Edge-triggered.
    Mode { id: String, mode: SessionMode },

    /// Running/idle transition. Edge-triggered.
    Status { id: String, status: SessionStatus },

    /// The session is gone: runner ended it or its connection closed.
    Ended { id: String },
}

impl SessionEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Started { id, .. }
            | SessionEvent::Renamed { id, .. }
            | SessionEvent::Message { id, .. }
            | SessionEvent::TodoList { id, .. }
            | SessionEvent::ToolCall { id, .. }
            | SessionEvent::ToolResult { id, .. }
            | SessionEvent::Mode { id, .. }
            | SessionEvent::Status { id, .. }
            | SessionEvent::Ended { id } => id,
        }
    }
}
