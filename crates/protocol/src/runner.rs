//! Session runner ⇄ manager messages (local rendezvous socket).
//!
//! Framing is one JSON object per line, newline-terminated. Field names
//! follow the runner's announcement format on the wire.

use serde::{Deserialize, Serialize};

/// Messages sent by a session runner to the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    SessionStart {
        id: String,
        name: String,
        cwd: String,
        #[serde(rename = "projectDir")]
        project_dir: String,
        #[serde(default)]
        command: Vec<String>,
    },
    SessionEnd {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Messages sent by the manager to a session runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    /// Bytes for the runner to write to the session's PTY.
    Input { text: String },
}
