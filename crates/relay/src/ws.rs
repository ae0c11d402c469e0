//! WebSocket handling for both connection roles.
//!
//! Every connection starts unauthenticated; the first acceptable client
//! frame is `auth{token}`. The server replies `auth_ok` or `auth_error`
//! and closes on error. After that, frames are dispatched according to the
//! role fixed by the admission path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_protocol::{ClientMessage, ServerMessage};

use crate::auth::TokenRole;
use crate::registry::{ConnId, ConnRole, RelayState, OUTBOUND_CAPACITY};

pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, role: ConnRole) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // All outbound frames for this connection funnel through one channel so
    // registry fan-out never touches the socket directly.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    warn!(
                        component = "relay",
                        event = "ws.serialize_failed",
                        error = %err,
                        "Failed to serialize server message"
                    );
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut authed: Option<(ConnId, String)> = None;

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(
                    component = "relay",
                    event = "ws.read_error",
                    error = %err,
                    "WebSocket read error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                let _ = outbound_tx
                    .send(ServerMessage::Error {
                        message: format!("malformed message: {err}"),
                    })
                    .await;
                continue;
            }
        };

        match (&authed, client_msg) {
            (None, ClientMessage::Auth { token }) => {
                match state.auth.verify(&token) {
                    Some(principal) if role_matches(role, principal.role) => {
                        let conn_id = state.add_connection(&principal.user, role, outbound_tx.clone());
                        info!(
                            component = "relay",
                            event = "ws.authenticated",
                            connection_id = conn_id,
                            user = %principal.user,
                            role = ?role,
                            "Connection authenticated"
                        );
                        let _ = outbound_tx.send(ServerMessage::AuthOk).await;
                        authed = Some((conn_id, principal.user));
                    }
                    _ => {
                        let _ = outbound_tx
                            .send(ServerMessage::AuthError {
                                message: "invalid token".to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
            (None, _) => {
                let _ = outbound_tx
                    .send(ServerMessage::AuthError {
                        message: "authenticate first".to_string(),
                    })
                    .await;
                break;
            }
            (Some(_), ClientMessage::Auth { .. }) => {
                let _ = outbound_tx
                    .send(ServerMessage::Error {
                        message: "already authenticated".to_string(),
                    })
                    .await;
            }
            (Some((conn_id, user)), msg) => {
                let conn_id = *conn_id;
                let user = user.clone();
                dispatch(&state, &outbound_tx, conn_id, &user, role, msg).await;
            }
        }
    }

    if let Some((conn_id, user)) = authed {
        debug!(
            component = "relay",
            event = "ws.closed",
            connection_id = conn_id,
            user = %user,
            "Connection closed"
        );
        state.remove_connection(conn_id);
    }
    // Let the sender drain queued frames (auth_error included) before the
    // socket goes away; it exits once every sender clone is gone.
    drop(outbound_tx);
    let _ = send_task.await;
}

fn role_matches(conn: ConnRole, token: TokenRole) -> bool {
    matches!(
        (conn, token),
        (ConnRole::Workstation, TokenRole::Workstation) | (ConnRole::Viewer, TokenRole::Viewer)
    )
}

async fn dispatch(
    state: &Arc<RelayState>,
    outbound: &mpsc::Sender<ServerMessage>,
    conn_id: ConnId,
    user: &str,
    role: ConnRole,
    msg: ClientMessage,
) {
    match (role, msg) {
        // -- workstation frames --
        (ConnRole::Workstation, ClientMessage::SessionStart { session_id, name, cwd }) => {
            let summary = tether_protocol::SessionSummary {
                id: session_id,
                name,
                cwd,
                status: tether_protocol::SessionStatus::Running,
                started_at: String::new(),
            };
            state.session_start(conn_id, user, summary);
        }
        (ConnRole::Workstation, ClientMessage::SessionUpdate { session_id, name }) => {
            state.session_update(user, &session_id, &name);
        }
        (ConnRole::Workstation, ClientMessage::SessionTodos { session_id, todos }) => {
            state.session_todos(user, &session_id, todos);
        }
        (ConnRole::Workstation, ClientMessage::SessionMessage { session_id, role, content }) => {
            state.session_message(user, &session_id, role, &content);
        }
        (ConnRole::Workstation, ClientMessage::SessionStatus { session_id, status }) => {
            state.session_status(user, &session_id, status);
        }
        (ConnRole::Workstation, ClientMessage::SessionEnd { session_id }) => {
            state.end_session(user, &session_id);
        }

        // -- viewer frames --
        (ConnRole::Viewer, ClientMessage::ListSessions) => {
            let _ = outbound
                .send(ServerMessage::SessionsList {
                    sessions: state.sessions_for(user),
                })
                .await;
        }
        (ConnRole::Viewer, ClientMessage::Subscribe { session_id }) => {
            if let Err(err) = state.subscribe(conn_id, user, &session_id) {
                let _ = outbound
                    .send(ServerMessage::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        }
        (ConnRole::Viewer, ClientMessage::Unsubscribe { session_id }) => {
            state.unsubscribe(conn_id, &session_id);
        }
        (ConnRole::Viewer, ClientMessage::SendInput { session_id, text }) => {
            if let Err(err) = state.send_input(user, &session_id, &text) {
                let _ = outbound
                    .send(ServerMessage::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        }
        (ConnRole::Viewer, ClientMessage::TrackSession { session_id }) => {
            state.track_session(user, &session_id, true);
        }
        (ConnRole::Viewer, ClientMessage::UntrackSession { session_id }) => {
            state.track_session(user, &session_id, false);
        }
        (ConnRole::Viewer, ClientMessage::RegisterPushToken { push_token }) => {
            state.register_push_token(user, &push_token);
        }

        // Anything else is a role violation.
        (_, other) => {
            debug!(
                component = "relay",
                event = "ws.role_violation",
                connection_id = conn_id,
                message = ?message_name(&other),
                "Message not allowed for this role"
            );
            let _ = outbound
                .send(ServerMessage::Error {
                    message: "not allowed for this connection".to_string(),
                })
                .await;
        }
    }
}

fn message_name(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Auth { .. } => "auth",
        ClientMessage::SessionStart { .. } => "session_start",
        ClientMessage::SessionUpdate { .. } => "session_update",
        ClientMessage::SessionTodos { .. } => "session_todos",
        ClientMessage::SessionMessage { .. } => "session_message",
        ClientMessage::SessionStatus { .. } => "session_status",
        ClientMessage::SessionEnd { .. } => "session_end",
        ClientMessage::ListSessions => "list_sessions",
        ClientMessage::Subscribe { .. } => "subscribe",
        ClientMessage::Unsubscribe { .. } => "unsubscribe",
        ClientMessage::SendInput { .. } => "send_input",
        ClientMessage::TrackSession { .. } => "track_session",
        ClientMessage::UntrackSession { .. } => "untrack_session",
        ClientMessage::RegisterPushToken { .. } => "register_push_token",
    }
}
