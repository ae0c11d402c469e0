//! Per-session transcript tailer.
//!
//! Wakes on filesystem notifications for the project directory and on a
//! periodic poll (belt-and-suspenders for dropped notifications), claims the
//! session's transcript once one qualifies, then re-reads it in full on each
//! wake. Records are deduplicated by a hash of their raw bytes, so the full
//! re-read emits each event exactly once.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use tether_protocol::{Role, SessionMode, SessionStatus};

use crate::discovery::candidate_transcripts;
use crate::events::SessionEvent;
use crate::manager::SessionManager;
use crate::transcript::{self, RecordKind};

/// Marker substrings in synthetic user messages that signal plan-mode
/// transitions.
const PLAN_ENTER_MARKER: &str = "Entered plan mode";
const PLAN_EXIT_MARKER: &str = "Exited plan mode";

pub(crate) struct Tailer {
    manager: SessionManager,
    session_id: String,
    project_dir: PathBuf,
    snapshot: HashMap<PathBuf, SystemTime>,
    started_at: DateTime<Utc>,
    claimed: Option<PathBuf>,
    seen: HashSet<[u8; 32]>,
    todo_hash: Option<[u8; 32]>,
    slug_done: bool,
    mode: SessionMode,
    last_record_at: Instant,
}

impl Tailer {
    pub(crate) fn new(
        manager: SessionManager,
        session_id: String,
        project_dir: PathBuf,
        snapshot: HashMap<PathBuf, SystemTime>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            manager,
            session_id,
            project_dir,
            snapshot,
            started_at,
            claimed: None,
            seen: HashSet::new(),
            todo_hash: None,
            slug_done: false,
            mode: SessionMode::Executing,
            last_record_at: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher: Option<RecommendedWatcher> = None;

        let mut poll = interval(self.manager.config().poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if watcher.is_none() {
                // The runner may create the project directory after the
                // announce; keep retrying until the watch sticks. The poll
                // carries discovery in the meantime.
                watcher = start_watcher(&self.project_dir, fs_tx.clone());
            }

            tokio::select! {
                _ = fs_rx.recv() => {
                    // Coalesce bursts of notifications into one pass.
                    while fs_rx.try_recv().is_ok() {}
                }
                _ = poll.tick() => {}
            }

            if !self.manager.session_exists(&self.session_id) {
                break;
            }
            if self.claimed.is_none() {
                self.try_claim();
            }
            if let Some(path) = self.claimed.clone() {
                self.process_file(&path);
            }
            self.check_idle();
        }
    }

    fn try_claim(&mut self) {
        for candidate in candidate_transcripts(&self.project_dir, &self.snapshot) {
            if self.manager.claim(&self.session_id, &candidate) {
                info!(
                    component = "tailer",
                    event = "transcript.claimed",
                    session_id = %self.session_id,
                    path = %candidate.display(),
                    "Transcript claimed"
                );
                self.claimed = Some(candidate);
                return;
            }
        }
    }

    fn process_file(&mut self, path: &Path) {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                // Transient read failures recover on the next poll.
                debug!(
                    component = "tailer",
                    event = "transcript.read_failed",
                    session_id = %self.session_id,
                    path = %path.display(),
                    error = %err,
                    "Transcript read failed"
                );
                return;
            }
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let digest: [u8; 32] = Sha256::digest(line.as_bytes()).into();
            if !self.seen.insert(digest) {
                continue;
            }
            self.handle_record(line);
        }
    }

    fn handle_record(&mut self, line: &str) {
        let Some(record) = transcript::parse_record(line) else {
            debug!(
                component = "tailer",
                event = "transcript.record_malformed",
                session_id = %self.session_id,
                "Skipping malformed transcript record"
            );
            return;
        };

        // Records predating session start belong to an earlier conversation
        // in the same file and never produce events.
        if let Some(ts) = record.timestamp {
            if ts < self.started_at {
                return;
            }
        }

        self.mark_activity();

        if let Some(slug) = record.slug.as_deref() {
            if !self.slug_done {
                self.slug_done = true;
                if self.manager.apply_slug(&self.session_id, slug) {
                    self.manager.emit(SessionEvent::Renamed {
                        id: self.session_id.clone(),
                        name: slug.to_string(),
                    });
                }
            }
        }

        if let Some(todos) = &record.todos {
            let serialized = serde_json::to_vec(todos).unwrap_or_default();
            let digest: [u8; 32] = Sha256::digest(&serialized).into();
            if self.todo_hash != Some(digest) {
                self.todo_hash = Some(digest);
                self.manager.emit(SessionEvent::TodoList {
                    id: self.session_id.clone(),
                    todos: todos.clone(),
                });
            }
        }

        let Some(content) = &record.content else {
            return;
        };

        if record.kind == RecordKind::User {
            // Plan-mode markers arrive in synthetic user messages, which are
            // meta and therefore never surface as conversational messages.
            let marker_text = transcript::message_text(content).unwrap_or_default();
            if marker_text.contains(PLAN_ENTER_MARKER) && self.mode != SessionMode::Planning {
                self.mode = SessionMode::Planning;
                self.manager.emit(SessionEvent::Mode {
                    id: self.session_id.clone(),
                    mode: SessionMode::Planning,
                });
            } else if marker_text.contains(PLAN_EXIT_MARKER) && self.mode != SessionMode::Executing {
                self.mode = SessionMode::Executing;
                self.manager.emit(SessionEvent::Mode {
                    id: self.session_id.clone(),
                    mode: SessionMode::Executing,
                });
            }
        }

        match record.kind {
            RecordKind::Assistant => {
                for call in transcript::tool_use_blocks(content) {
                    self.manager.emit(SessionEvent::ToolCall {
                        id: self.session_id.clone(),
                        call_id: call.id,
                        name: call.name,
                        input: call.input,
                    });
                }
            }
            RecordKind::User => {
                for result in transcript::tool_result_blocks(content) {
                    self.manager.emit(SessionEvent::ToolResult {
                        id: self.session_id.clone(),
                        call_id: result.tool_use_id,
                        text: result.content,
                        is_error: result.is_error,
                    });
                }
            }
            _ => {}
        }

        let role = match record.kind {
            RecordKind::User => Role::User,
            RecordKind::Assistant => Role::Assistant,
            _ => return,
        };
        if record.is_meta || record.subtype.is_some() {
            return;
        }
        let Some(text) = transcript::message_text(content) else {
            return;
        };
        self.manager.emit(SessionEvent::Message {
            id: self.session_id.clone(),
            role,
            text,
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
        });
    }

    fn mark_activity(&mut self) {
        self.last_record_at = Instant::now();
        if self.manager.set_status(&self.session_id, SessionStatus::Running) {
            self.manager.emit(SessionEvent::Status {
                id: self.session_id.clone(),
                status: SessionStatus::Running,
            });
        }
    }

    fn check_idle(&mut self) {
        if self.last_record_at.elapsed() < self.manager.config().idle_after {
            return;
        }
        if self.manager.set_status(&self.session_id, SessionStatus::Idle) {
            self.manager.emit(SessionEvent::Status {
                id: self.session_id.clone(),
                status: SessionStatus::Idle,
            });
        }
    }
}

fn start_watcher(dir: &Path, tx: mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
    if !dir.is_dir() {
        return None;
    }
    let result = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                ) {
                    let _ = tx.send(());
                }
            }
            Err(err) => {
                warn!(
                    component = "tailer",
                    event = "watch.event_error",
                    error = %err,
                    "Filesystem watch error"
                );
            }
        },
        notify::Config::default(),
    );

    match result {
        Ok(mut watcher) => match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(err) => {
                debug!(
                    component = "tailer",
                    event = "watch.register_failed",
                    path = %dir.display(),
                    error = %err,
                    "Could not watch project directory; polling only"
                );
                None
            }
        },
        Err(err) => {
            debug!(
                component = "tailer",
                event = "watch.create_failed",
                error = %err,
                "Could not create watcher; polling only"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::session::SessionAnnounce;
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    fn fast_manager(idle_after: Duration) -> SessionManager {
        SessionManager::new(ManagerConfig {
            idle_after,
            poll_interval: Duration::from_millis(25),
            submit_delay: Duration::from_millis(5),
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

    fn now_ts() -> String {
        Utc::now().to_rfc3339()
    }

    fn user_line(text: &str, ts: &str) -> String {
        format!(
            r#"{{"type":"user","timestamp":"{ts}","message":{{"role":"user","content":"{text}"}}}}"#
        )
    }

    fn assistant_line(text: &str, ts: &str) -> String {
        format!(
            r#"{{"type":"assistant","timestamp":"{ts}","message":{{"role":"assistant","content":[{{"type":"text","text":"{text}"}}]}}}}"#
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// No events of interest arrive within the window.
    async fn assert_quiet(rx: &mut broadcast::Receiver<SessionEvent>, window: Duration) {
        match timeout(window, rx.recv()).await {
            Err(_) => {}
            Ok(event) => panic!("expected quiet stream, got {event:?}"),
        }
    }

    #[tokio::test]
    async fn cold_start_emits_slug_then_messages_in_order() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();

        match next_event(&mut events).await {
            SessionEvent::Started { id, name, .. } => {
                assert_eq!(id, "s1");
                assert_eq!(name, "claude");
            }
            other => panic!("expected Started, got {other:?}"),
        }

        // Slug arrives first but the file only qualifies for claiming once a
        // conversational record exists; the full re-read preserves order.
        let path = dir.path().join("s1.jsonl");
        let ts = now_ts();
        let slug_line =
            format!(r#"{{"type":"system","subtype":"init","slug":"refactor","timestamp":"{ts}"}}"#);
        std::fs::write(
            &path,
            format!(
                "{slug_line}\n{}\n{}\n",
                user_line("hi", &ts),
                assistant_line("hello", &ts),
            ),
        )
        .unwrap();

        match next_event(&mut events).await {
            SessionEvent::Renamed { id, name } => {
                assert_eq!(id, "s1");
                assert_eq!(name, "refactor");
            }
            other => panic!("expected Renamed, got {other:?}"),
        }
        match next_event(&mut events).await {
            SessionEvent::Message { role, text, .. } => {
                assert_eq!(role, Role::User);
                assert_eq!(text, "hi");
            }
            other => panic!("expected user message, got {other:?}"),
        }
        match next_event(&mut events).await {
            SessionEvent::Message { role, text, .. } => {
                assert_eq!(role, Role::Assistant);
                assert_eq!(text, "hello");
            }
            other => panic!("expected assistant message, got {other:?}"),
        }

        assert_eq!(manager.get("s1").unwrap().name, "refactor");
    }

    #[tokio::test]
    async fn resumed_session_skips_records_before_start() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("old.jsonl");
        std::fs::write(
            &path,
            format!("{}\n", user_line("ancient history", "2020-01-01T00:00:00Z")),
        )
        .unwrap();

        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s2", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        // Touch past the snapshot mtime with a fresh record.
        std::thread::sleep(Duration::from_millis(20));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", user_line("continue", &now_ts())).unwrap();

        match next_event(&mut events).await {
            SessionEvent::Message { role, text, .. } => {
                assert_eq!(role, Role::User);
                assert_eq!(text, "continue");
            }
            other => panic!("expected only the fresh message, got {other:?}"),
        }
        assert_quiet(&mut events, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn identical_record_bytes_are_emitted_once() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        let line = user_line("hi", &now_ts());
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, format!("{line}\n")).unwrap();
        let SessionEvent::Message { .. } = next_event(&mut events).await else {
            panic!("expected message");
        };

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{line}").unwrap();
        assert_quiet(&mut events, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn one_new_transcript_is_claimed_by_exactly_one_session() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s4", dir.path()), tx.clone()).unwrap();
        manager.register(announce("s5", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        std::fs::write(
            dir.path().join("shared.jsonl"),
            format!("{}\n", user_line("hi", &now_ts())),
        )
        .unwrap();

        let first = next_event(&mut events).await;
        let SessionEvent::Message { id: winner, .. } = first else {
            panic!("expected message, got {first:?}");
        };
        assert!(winner == "s4" || winner == "s5");
        // The loser stays in waiting-for-file: no duplicate events.
        assert_quiet(&mut events, Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn plan_mode_markers_are_edge_triggered_and_not_messages() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        let ts = now_ts();
        let meta_marker = |marker: &str| {
            format!(
                r#"{{"type":"user","isMeta":true,"timestamp":"{ts}","message":{{"role":"user","content":"{marker}"}}}}"#
            )
        };
        std::fs::write(
            dir.path().join("s1.jsonl"),
            format!(
                "{}\n{}\n{}\n{}\n",
                user_line("plan this", &ts),
                meta_marker("Entered plan mode"),
                meta_marker("Entered plan mode again"),
                meta_marker("Exited plan mode"),
            ),
        )
        .unwrap();

        let SessionEvent::Message { .. } = next_event(&mut events).await else {
            panic!("expected the opening user message");
        };
        match next_event(&mut events).await {
            SessionEvent::Mode { mode, .. } => assert_eq!(mode, SessionMode::Planning),
            other => panic!("expected Planning, got {other:?}"),
        }
        // Second marker is absorbed; next edge is the exit.
        match next_event(&mut events).await {
            SessionEvent::Mode { mode, .. } => assert_eq!(mode, SessionMode::Executing),
            other => panic!("expected Executing, got {other:?}"),
        }
        assert_quiet(&mut events, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn todo_lists_fire_only_on_content_change() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        let ts = now_ts();
        let todos_line = |seq: u32, todos: &str| {
            format!(
                r#"{{"type":"user","isMeta":true,"subtype":"todo","seq":{seq},"timestamp":"{ts}","todos":{todos}}}"#
            )
        };
        std::fs::write(
            dir.path().join("s1.jsonl"),
            format!(
                "{}\n{}\n{}\n{}\n",
                user_line("hi", &ts),
                todos_line(1, r#"[{"text":"one","completed":false}]"#),
                todos_line(2, r#"[{"text":"one","completed":false}]"#),
                todos_line(3, r#"[{"text":"one","completed":true}]"#),
            ),
        )
        .unwrap();

        let SessionEvent::Message { .. } = next_event(&mut events).await else {
            panic!("expected user message");
        };
        match next_event(&mut events).await {
            SessionEvent::TodoList { todos, .. } => assert!(!todos[0].completed),
            other => panic!("expected first todo list, got {other:?}"),
        }
        // Identical list is suppressed; the completed flip comes through.
        match next_event(&mut events).await {
            SessionEvent::TodoList { todos, .. } => assert!(todos[0].completed),
            other => panic!("expected changed todo list, got {other:?}"),
        }
        assert_quiet(&mut events, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn tool_blocks_become_tool_events() {
        let manager = fast_manager(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        let ts = now_ts();
        let call = format!(
            r#"{{"type":"assistant","timestamp":"{ts}","message":{{"role":"assistant","content":[{{"type":"tool_use","id":"call-1","name":"Bash","input":{{"command":"ls"}}}}]}}}}"#
        );
        let result = format!(
            r#"{{"type":"user","timestamp":"{ts}","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"call-1","content":"README.md","is_error":false}}]}}}}"#
        );
        std::fs::write(
            dir.path().join("s1.jsonl"),
            format!("{}\n{call}\n{result}\n", user_line("ls please", &ts)),
        )
        .unwrap();

        let SessionEvent::Message { .. } = next_event(&mut events).await else {
            panic!("expected user message");
        };
        match next_event(&mut events).await {
            SessionEvent::ToolCall { call_id, name, .. } => {
                assert_eq!(call_id, "call-1");
                assert_eq!(name, "Bash");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        match next_event(&mut events).await {
            SessionEvent::ToolResult {
                call_id, is_error, ..
            } => {
                assert_eq!(call_id, "call-1");
                assert!(!is_error);
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quiet_transcript_flips_running_to_idle_once() {
        let manager = fast_manager(Duration::from_millis(300));
        let dir = tempfile::tempdir().unwrap();
        let mut events = manager.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        manager.register(announce("s1", dir.path()), tx).unwrap();
        let SessionEvent::Started { .. } = next_event(&mut events).await else {
            panic!("expected Started");
        };

        std::fs::write(
            dir.path().join("s1.jsonl"),
            format!("{}\n", user_line("hi", &now_ts())),
        )
        .unwrap();
        let SessionEvent::Message { .. } = next_event(&mut events).await else {
            panic!("expected message");
        };

        match next_event(&mut events).await {
            SessionEvent::Status { status, .. } => assert_eq!(status, SessionStatus::Idle),
            other => panic!("expected Idle status, got {other:?}"),
        }
        assert_eq!(manager.get("s1").unwrap().status, SessionStatus::Idle);
        assert_quiet(&mut events, Duration::from_millis(300)).await;
    }
}
