//! Per-session state held by the manager.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_protocol::{ManagerMessage, SessionStatus, SessionSummary};

/// A runner's announcement of a new session.
#[derive(Debug, Clone)]
pub struct SessionAnnounce {
    pub id: String,
    pub name: String,
    pub cwd: String,
    pub project_dir: PathBuf,
    pub command: Vec<String>,
}

/// A live session owned by the manager.
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) cwd: String,
    pub(crate) status: SessionStatus,
    pub(crate) started_at: DateTime<Utc>,
    /// Frames queued here are written to the runner socket by its writer task.
    pub(crate) runner_tx: mpsc::Sender<ManagerMessage>,
    /// The claimed transcript path, once discovery succeeds.
    pub(crate) transcript: Option<PathBuf>,
    pub(crate) tailer: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(announce: &SessionAnnounce, runner_tx: mpsc::Sender<ManagerMessage>) -> Self {
        let name = if announce.name.trim().is_empty() {
            announce.command.join(" ")
        } else {
            announce.name.clone()
        };
        Self {
            id: announce.id.clone(),
            name,
            cwd: announce.cwd.clone(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            runner_tx,
            transcript: None,
            tailer: None,
        }
    }

    pub(crate) fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            cwd: self.cwd.clone(),
            status: self.status,
            started_at: self.started_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(name: &str, command: &[&str]) -> SessionAnnounce {
        SessionAnnounce {
            id: "s1".into(),
            name: name.into(),
            cwd: "/work".into(),
            project_dir: PathBuf::from("/work/.transcripts"),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_name_falls_back_to_command() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(&announce("  ", &["claude", "--resume"]), tx);
        assert_eq!(session.name, "claude --resume");
    }

    #[test]
    fn explicit_name_wins_over_command() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(&announce("refactor", &["claude"]), tx);
        assert_eq!(session.name, "refactor");
    }
}
