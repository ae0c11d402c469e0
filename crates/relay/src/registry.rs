//! Connection and session registry with the fan-out rules.
//!
//! Shared maps are guarded by fine-grained mutexes, never held across an
//! await. Lock order where two are needed: `sessions` before
//! `connections`. Outbound delivery uses bounded channels and `try_send`:
//! a viewer that cannot drain its queue is disconnected rather than
//! allowed to stall the hub.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_protocol::{Role, ServerMessage, SessionStatus, SessionSummary, TodoItem};

use crate::auth::TokenStore;
use crate::pairing::PairingStore;
use crate::push::{PushGateway, PushKind, PushNotification};

pub type ConnId = u64;

/// Number of recent conversational messages replayed on subscribe.
const REPLAY_LIMIT: usize = 100;
/// Outbound frames buffered per connection before it counts as stalled.
pub(crate) const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("session not found")]
    SessionNotFound,
    #[error("session has no connected workstation")]
    SessionGone,
    #[error("not allowed for this connection")]
    NotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnRole {
    Workstation,
    Viewer,
}

pub(crate) struct ConnectionEntry {
    user: String,
    role: ConnRole,
    outbound: mpsc::Sender<ServerMessage>,
}

struct TrackedSession {
    summary: SessionSummary,
    user: String,
    owner: Option<ConnId>,
    /// Ring of recent conversational messages; task lists keep last-value.
    recent: VecDeque<ServerMessage>,
    todos: Option<Vec<TodoItem>>,
    subscribers: HashSet<ConnId>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public base URL used to build pairing verification links.
    pub base_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4600".to_string(),
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub connections_total: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub pushes_dispatched: AtomicU64,
}

pub struct RelayState {
    pub auth: TokenStore,
    pub pairing: PairingStore,
    pub(crate) push: Arc<dyn PushGateway>,
    pub(crate) config: RelayConfig,
    pub(crate) counters: Counters,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<ConnId, ConnectionEntry>>,
    sessions: Mutex<HashMap<String, TrackedSession>>,
    /// user → session ids flagged for idle/ended push.
    tracked: Mutex<HashMap<String, HashSet<String>>>,
    /// user → registered notification tokens.
    push_tokens: Mutex<HashMap<String, Vec<String>>>,
}

impl RelayState {
    pub fn new(config: RelayConfig, auth: TokenStore, push: Arc<dyn PushGateway>) -> Self {
        Self {
            auth,
            pairing: PairingStore::new(),
            push,
            config,
            counters: Counters::default(),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            push_tokens: Mutex::new(HashMap::new()),
        }
    }

    // -- connection lifecycle --

    pub(crate) fn add_connection(
        &self,
        user: &str,
        role: ConnRole,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.counters
            .connections_total
            .fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().expect("connections lock");
        connections.insert(
            conn_id,
            ConnectionEntry {
                user: user.to_string(),
                role,
                outbound,
            },
        );
        conn_id
    }

    pub(crate) fn remove_connection(&self, conn_id: ConnId) {
        let entry = {
            let mut connections = self.connections.lock().expect("connections lock");
            connections.remove(&conn_id)
        };
        let Some(entry) = entry else {
            return;
        };

        match entry.role {
            ConnRole::Viewer => {
                let mut sessions = self.sessions.lock().expect("sessions lock");
                for session in sessions.values_mut() {
                    session.subscribers.remove(&conn_id);
                }
            }
            ConnRole::Workstation => {
                // Every session this workstation owned is over.
                let owned: Vec<String> = {
                    let sessions = self.sessions.lock().expect("sessions lock");
                    sessions
                        .iter()
                        .filter(|(_, s)| s.owner == Some(conn_id))
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for session_id in owned {
                    self.end_session(&entry.user, &session_id);
                }
                info!(
                    component = "relay",
                    event = "workstation.disconnected",
                    connection_id = conn_id,
                    user = %entry.user,
                    "Workstation disconnected"
                );
            }
        }
    }

    // -- workstation inbound --

    pub(crate) fn session_start(&self, conn_id: ConnId, user: &str, mut summary: SessionSummary) {
        if summary.started_at.is_empty() {
            summary.started_at = chrono::Utc::now().to_rfc3339();
        }
        {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            match sessions.get_mut(&summary.id) {
                // Re-announce after reconnect: adopt the session, keep history.
                Some(existing) if existing.user == user => {
                    existing.owner = Some(conn_id);
                    existing.summary = summary.clone();
                }
                Some(_) => {
                    warn!(
                        component = "relay",
                        event = "session.id_collision",
                        session_id = %summary.id,
                        user = %user,
                        "Session id already owned by another user; ignoring announce"
                    );
                    return;
                }
                None => {
                    sessions.insert(
                        summary.id.clone(),
                        TrackedSession {
                            user: user.to_string(),
                            owner: Some(conn_id),
                            recent: VecDeque::new(),
                            todos: None,
                            subscribers: HashSet::new(),
                            summary: summary.clone(),
                        },
                    );
                }
            }
        }
        self.broadcast_sessions_list(user);
    }

    pub(crate) fn session_update(&self, user: &str, session_id: &str, name: &str) {
        let stalled = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let Some(session) = sessions.get_mut(session_id).filter(|s| s.user == user) else {
                return;
            };
            session.summary.name = name.to_string();
            self.fan_out_locked(
                session,
                ServerMessage::SessionUpdate {
                    session_id: session_id.to_string(),
                    name: name.to_string(),
                },
            )
        };
        self.drop_stalled(stalled);
    }

    pub(crate) fn session_message(&self, user: &str, session_id: &str, role: Role, content: &str) {
        let stalled = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let Some(session) = sessions.get_mut(session_id).filter(|s| s.user == user) else {
                return;
            };
            let frame = ServerMessage::SessionMessage {
                session_id: session_id.to_string(),
                role,
                content: content.to_string(),
            };
            session.recent.push_back(frame.clone());
            while session.recent.len() > REPLAY_LIMIT {
                session.recent.pop_front();
            }
            self.fan_out_locked(session, frame)
        };
        self.drop_stalled(stalled);
    }

    pub(crate) fn session_todos(&self, user: &str, session_id: &str, todos: Vec<TodoItem>) {
        let stalled = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let Some(session) = sessions.get_mut(session_id).filter(|s| s.user == user) else {
                return;
            };
            session.todos = Some(todos.clone());
            self.fan_out_locked(
                session,
                ServerMessage::SessionTodos {
                    session_id: session_id.to_string(),
                    todos,
                },
            )
        };
        self.drop_stalled(stalled);
    }

    pub(crate) fn session_status(&self, user: &str, session_id: &str, status: SessionStatus) {
        let stalled = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let Some(session) = sessions.get_mut(session_id).filter(|s| s.user == user) else {
                return;
            };
            // Ended is terminal; a full end arrives as session_end.
            if session.summary.status == SessionStatus::Ended || session.summary.status == status {
                return;
            }
            session.summary.status = status;
            self.fan_out_locked(
                session,
                ServerMessage::SessionStatus {
                    session_id: session_id.to_string(),
                    status,
                },
            )
        };
        self.drop_stalled(stalled);

        if status == SessionStatus::Idle {
            self.dispatch_push(user, session_id, None, PushKind::Idle);
        }
    }

    pub(crate) fn end_session(&self, user: &str, session_id: &str) {
        let (stalled, session_name) = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let Some(session) = sessions.get_mut(session_id).filter(|s| s.user == user) else {
                return;
            };
            session.summary.status = SessionStatus::Ended;
            let name = session.summary.name.clone();
            let stalled = self.fan_out_locked(
                session,
                ServerMessage::SessionStatus {
                    session_id: session_id.to_string(),
                    status: SessionStatus::Ended,
                },
            );
            sessions.remove(session_id);
            (stalled, name)
        };
        self.drop_stalled(stalled);

        self.dispatch_push(user, session_id, Some(session_name), PushKind::Ended);
        {
            let mut tracked = self.tracked.lock().expect("tracked lock");
            if let Some(set) = tracked.get_mut(user) {
                set.remove(session_id);
            }
        }
        self.broadcast_sessions_list(user);
    }

    // -- viewer inbound --

    pub(crate) fn sessions_for(&self, user: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().expect("sessions lock");
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.user == user)
            .map(|s| s.summary.clone())
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Subscribe a viewer: current status first, then up to the last
    /// `REPLAY_LIMIT` messages and the latest task list, then live
    /// forwarding. Replay and registration happen under the sessions lock,
    /// so no live frame can interleave.
    pub(crate) fn subscribe(
        &self,
        conn_id: ConnId,
        user: &str,
        session_id: &str,
    ) -> Result<(), RelayError> {
        let outbound = self
            .connection_sender(conn_id)
            .ok_or(RelayError::NotAllowed)?;

        let mut sessions = self.sessions.lock().expect("sessions lock");
        let session = sessions
            .get_mut(session_id)
            .filter(|s| s.user == user)
            .ok_or(RelayError::SessionNotFound)?;

        let mut replay = Vec::with_capacity(session.recent.len() + 2);
        replay.push(ServerMessage::SessionStatus {
            session_id: session_id.to_string(),
            status: session.summary.status,
        });
        replay.extend(session.recent.iter().cloned());
        if let Some(todos) = &session.todos {
            replay.push(ServerMessage::SessionTodos {
                session_id: session_id.to_string(),
                todos: todos.clone(),
            });
        }
        for frame in replay {
            // Replay bursts fit well inside the outbound buffer; a viewer
            // that is already full here is hopeless anyway.
            let _ = outbound.try_send(frame);
        }
        session.subscribers.insert(conn_id);
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, conn_id: ConnId, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("sessions lock");
        if let Some(session) = sessions.get_mut(session_id) {
            session.subscribers.remove(&conn_id);
        }
    }

    /// Route viewer input to the owning workstation.
    pub(crate) fn send_input(
        &self,
        user: &str,
        session_id: &str,
        text: &str,
    ) -> Result<(), RelayError> {
        let owner = {
            let sessions = self.sessions.lock().expect("sessions lock");
            let session = sessions
                .get(session_id)
                .filter(|s| s.user == user)
                .ok_or(RelayError::SessionNotFound)?;
            session.owner
        };
        let Some(owner) = owner else {
            return Err(RelayError::SessionGone);
        };
        let Some(outbound) = self.connection_sender(owner) else {
            self.end_session(user, session_id);
            return Err(RelayError::SessionGone);
        };
        let frame = ServerMessage::SendInput {
            session_id: session_id.to_string(),
            text: text.to_string(),
        };
        if outbound.try_send(frame).is_err() {
            self.end_session(user, session_id);
            return Err(RelayError::SessionGone);
        }
        Ok(())
    }

    pub(crate) fn track_session(&self, user: &str, session_id: &str, track: bool) {
        let mut tracked = self.tracked.lock().expect("tracked lock");
        let set = tracked.entry(user.to_string()).or_default();
        if track {
            set.insert(session_id.to_string());
        } else {
            set.remove(session_id);
        }
    }

    pub(crate) fn register_push_token(&self, user: &str, token: &str) {
        let mut push_tokens = self.push_tokens.lock().expect("push tokens lock");
        let tokens = push_tokens.entry(user.to_string()).or_default();
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }

    // -- shared --

    /// Authoritative snapshot broadcast to every viewer of a user.
    pub(crate) fn broadcast_sessions_list(&self, user: &str) {
        let sessions = self.sessions_for(user);
        let connections = self.connections.lock().expect("connections lock");
        for entry in connections.values() {
            if entry.role == ConnRole::Viewer && entry.user == user {
                let _ = entry.outbound.try_send(ServerMessage::SessionsList {
                    sessions: sessions.clone(),
                });
            }
        }
    }

    pub fn health(&self) -> Value {
        let connections = self.connections.lock().expect("connections lock");
        let (workstations, viewers) = connections.values().fold((0u64, 0u64), |acc, e| {
            match e.role {
                ConnRole::Workstation => (acc.0 + 1, acc.1),
                ConnRole::Viewer => (acc.0, acc.1 + 1),
            }
        });
        let sessions = self.sessions.lock().expect("sessions lock");
        json!({
            "status": "ok",
            "workstations": workstations,
            "viewers": viewers,
            "sessions": sessions.len(),
            "connections_total": self.counters.connections_total.load(Ordering::Relaxed),
            "messages_forwarded": self.counters.messages_forwarded.load(Ordering::Relaxed),
            "pushes_dispatched": self.counters.pushes_dispatched.load(Ordering::Relaxed),
        })
    }

    fn connection_sender(&self, conn_id: ConnId) -> Option<mpsc::Sender<ServerMessage>> {
        let connections = self.connections.lock().expect("connections lock");
        connections.get(&conn_id).map(|e| e.outbound.clone())
    }

    /// Forward a frame to a session's subscribers. Returns the connections
    /// whose queues were full — they get dropped once locks are released.
    fn fan_out_locked(&self, session: &TrackedSession, frame: ServerMessage) -> Vec<ConnId> {
        let mut stalled = Vec::new();
        let connections = self.connections.lock().expect("connections lock");
        for conn_id in &session.subscribers {
            let Some(entry) = connections.get(conn_id) else {
                continue;
            };
            match entry.outbound.try_send(frame.clone()) {
                Ok(()) => {
                    self.counters
                        .messages_forwarded
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        component = "relay",
                        event = "viewer.stalled",
                        connection_id = conn_id,
                        "Viewer outbound queue full; dropping connection"
                    );
                    stalled.push(*conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stalled.push(*conn_id),
            }
        }
        stalled
    }

    fn drop_stalled(&self, stalled: Vec<ConnId>) {
        for conn_id in stalled {
            self.remove_connection(conn_id);
        }
    }

    fn dispatch_push(
        &self,
        user: &str,
        session_id: &str,
        session_name: Option<String>,
        kind: PushKind,
    ) {
        let is_tracked = {
            let tracked = self.tracked.lock().expect("tracked lock");
            tracked
                .get(user)
                .is_some_and(|set| set.contains(session_id))
        };
        if !is_tracked {
            return;
        }
        let tokens = {
            let push_tokens = self.push_tokens.lock().expect("push tokens lock");
            push_tokens.get(user).cloned().unwrap_or_default()
        };
        let session_name = session_name.unwrap_or_else(|| {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions
                .get(session_id)
                .map(|s| s.summary.name.clone())
                .unwrap_or_else(|| session_id.to_string())
        });
        self.counters
            .pushes_dispatched
            .fetch_add(1, Ordering::Relaxed);
        self.push.dispatch(
            user,
            &tokens,
            PushNotification {
                session_id: session_id.to_string(),
                session_name,
                kind,
            },
        );
    }
}
