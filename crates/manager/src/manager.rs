//! Session registry and the operations exposed to callers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tether_protocol::{ManagerMessage, SessionStatus, SessionSummary};

use crate::discovery::snapshot_project_dir;
use crate::error::ManagerError;
use crate::events::SessionEvent;
use crate::session::{Session, SessionAnnounce};
use crate::tailer::Tailer;

/// Tuning knobs for the manager. Defaults match production behavior; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Transcript silence after which a running session is reported idle.
    pub idle_after: Duration,
    /// Backstop poll for missed filesystem notifications.
    pub poll_interval: Duration,
    /// Gap between the input text frame and the synthetic carriage return.
    pub submit_delay: Duration,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            submit_delay: Duration::from_millis(50),
            event_capacity: 1024,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: ManagerConfig,
    sessions: Mutex<HashMap<String, Session>>,
    /// Process-wide set of transcript paths claimed by live sessions.
    claimed: Mutex<HashSet<PathBuf>>,
    events: broadcast::Sender<SessionEvent>,
}

/// The session manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                claimed: Mutex::new(HashSet::new()),
                events,
            }),
        }
    }

    /// Subscribe to the typed event stream. Events arrive in transcript
    /// order per session; a lagging receiver misses events rather than
    /// blocking the tailer.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Register a session announced by a runner and start watching for its
    /// transcript. `runner_tx` frames are written to the runner socket.
    pub fn register(
        &self,
        announce: SessionAnnounce,
        runner_tx: mpsc::Sender<ManagerMessage>,
    ) -> Result<(), ManagerError> {
        let snapshot = snapshot_project_dir(&announce.project_dir);
        let mut session = Session::new(&announce, runner_tx);
        let (name, cwd, started_at) = (session.name.clone(), session.cwd.clone(), session.started_at);

        {
            let mut sessions = self.inner.sessions.lock().expect("sessions lock");
            if sessions.contains_key(&announce.id) {
                return Err(ManagerError::DuplicateSession(announce.id));
            }
            let tailer = Tailer::new(
                self.clone(),
                announce.id.clone(),
                announce.project_dir.clone(),
                snapshot,
                started_at,
            );
            session.tailer = Some(tokio::spawn(tailer.run()));
            sessions.insert(announce.id.clone(), session);
        }

        info!(
            component = "manager",
            event = "session.registered",
            session_id = %announce.id,
            project_dir = %announce.project_dir.display(),
            "Session registered"
        );
        self.emit(SessionEvent::Started {
            id: announce.id,
            name,
            cwd,
        });
        Ok(())
    }

    /// Forward input text to a session's runner, followed ~50 ms later by a
    /// carriage return so the terminal submits. Returns `false` when the
    /// session is unknown or its runner connection has failed; the failure
    /// case also tears the session down.
    pub async fn send_input(&self, id: &str, text: &str) -> bool {
        let Some(runner_tx) = self.runner_tx(id) else {
            debug!(
                component = "manager",
                event = "input.unknown_session",
                session_id = %id,
                "Dropping input for unknown session"
            );
            return false;
        };

        let frames = [
            ManagerMessage::Input { text: text.to_string() },
            ManagerMessage::Input { text: "\r".to_string() },
        ];
        for (i, frame) in frames.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inner.config.submit_delay).await;
            }
            if runner_tx.send(frame).await.is_err() {
                warn!(
                    component = "manager",
                    event = "input.runner_gone",
                    session_id = %id,
                    "Runner connection failed while forwarding input"
                );
                self.end(id);
                return false;
            }
        }
        true
    }

    /// Tear a session down: stop its tailer, release its transcript claim,
    /// drop its state and emit `Ended`. Idempotent.
    pub fn end(&self, id: &str) {
        let removed = {
            let mut sessions = self.inner.sessions.lock().expect("sessions lock");
            sessions.remove(id)
        };
        let Some(session) = removed else {
            return;
        };
        if let Some(tailer) = session.tailer {
            tailer.abort();
        }
        if let Some(path) = session.transcript {
            self.release_claim(&path);
        }
        info!(
            component = "manager",
            event = "session.ended",
            session_id = %id,
            "Session ended"
        );
        self.emit(SessionEvent::Ended { id: id.to_string() });
    }

    pub fn get(&self, id: &str) -> Option<SessionSummary> {
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        sessions.get(id).map(Session::summary)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        let mut all: Vec<SessionSummary> = sessions.values().map(Session::summary).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    // -- internal, used by the tailer and rendezvous --

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine — nobody is listening yet.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn runner_tx(&self, id: &str) -> Option<mpsc::Sender<ManagerMessage>> {
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        sessions.get(id).map(|s| s.runner_tx.clone())
    }

    pub(crate) fn session_exists(&self, id: &str) -> bool {
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        sessions.contains_key(id)
    }

    /// Claim a transcript path for a session. Exactly one live session may
    /// hold a given path; returns `false` when it is already taken.
    pub(crate) fn claim(&self, id: &str, path: &Path) -> bool {
        let mut claimed = self.inner.claimed.lock().expect("claimed lock");
        if !claimed.insert(path.to_path_buf()) {
            return false;
        }
        drop(claimed);

        let mut sessions = self.inner.sessions.lock().expect("sessions lock");
        match sessions.get_mut(id) {
            Some(session) => {
                session.transcript = Some(path.to_path_buf());
                true
            }
            None => {
                drop(sessions);
                self.release_claim(path);
                false
            }
        }
    }

    pub(crate) fn release_claim(&self, path: &Path) {
        let mut claimed = self.inner.claimed.lock().expect("claimed lock");
        claimed.remove(path);
    }

    /// Apply the transcript-derived slug as the display name. The tailer
    /// guarantees this fires at most once per session.
    pub(crate) fn apply_slug(&self, id: &str, slug: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().expect("sessions lock");
        match sessions.get_mut(id) {
            Some(session) => {
                session.name = slug.to_string();
                true
            }
            None => false,
        }
    }

    /// Record a status transition. Returns `true` when the status actually
    /// changed; `Ended` is absorbing.
    pub(crate) fn set_status(&self, id: &str, status: SessionStatus) -> bool {
        let mut sessions = self.inner.sessions.lock().expect("sessions lock");
        match sessions.get_mut(id) {
            Some(session) => {
                if session.status == status || session.status == SessionStatus::Ended {
                    return false;
                }
                session.status = status;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn test_manager() -> SessionManager {
        SessionManager::new(ManagerConfig {
            idle_after: Duration::from_secs(60),
            poll_interval: Duration::from_millis(25),
            submit_delay: Duration::from_millis(50),
            event_capacity: 256,
        })
    }

    fn announce(id: &str, project_dir: &Path) -> SessionAnnounce {
        SessionAnnounce {
            id: id.into(),
            name: "claude".into(),
            cwd: "/work".into(),
            project_dir: project_dir.to_path_buf(),
            command: vec!["claude".into()],
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let manager = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);

        manager.register(announce("s1", dir.path()), tx.clone()).unwrap();
        let err = manager.register(announce("s1", dir.path()), tx).unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateSession(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_input_writes_text_then_carriage_return() {
        let manager = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();

        let started = Instant::now();
        assert!(manager.send_input("s1", "run tests").await);

        let ManagerMessage::Input { text } = rx.recv().await.unwrap();
        assert_eq!(text, "run tests");
        let ManagerMessage::Input { text } = rx.recv().await.unwrap();
        assert_eq!(text, "\r");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn send_input_to_unknown_session_is_false() {
        let manager = test_manager();
        assert!(!manager.send_input("nope", "hello").await);
    }

    #[tokio::test]
    async fn runner_failure_tears_the_session_down() {
        let manager = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let mut events = manager.subscribe();
        drop(rx);

        assert!(!manager.send_input("s1", "hello").await);
        assert!(manager.get("s1").is_none());
        match events.recv().await.unwrap() {
            SessionEvent::Ended { id } => assert_eq!(id, "s1"),
            other => panic!("expected Ended, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_across_sessions() {
        let manager = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s4", dir.path()), tx.clone()).unwrap();
        manager.register(announce("s5", dir.path()), tx).unwrap();

        let path = dir.path().join("shared.jsonl");
        assert!(manager.claim("s4", &path));
        assert!(!manager.claim("s5", &path));

        // Released on end, claimable again.
        manager.end("s4");
        assert!(manager.claim("s5", &path));
    }

    #[tokio::test]
    async fn status_transitions_are_monotone_toward_ended() {
        let manager = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();

        assert!(manager.set_status("s1", SessionStatus::Idle));
        assert!(!manager.set_status("s1", SessionStatus::Idle));
        assert!(manager.set_status("s1", SessionStatus::Running));
        assert!(manager.set_status("s1", SessionStatus::Ended));
        assert!(!manager.set_status("s1", SessionStatus::Running));
    }

    #[tokio::test]
    async fn end_is_idempotent_and_emits_once() {
        let manager = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let mut events = manager.subscribe();

        manager.end("s1");
        manager.end("s1");

        match events.recv().await.unwrap() {
            SessionEvent::Ended { id } => assert_eq!(id, "s1"),
            other => panic!("expected Ended, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
