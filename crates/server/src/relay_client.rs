//! Workstation-side relay client.
//!
//! Maintains an outbound websocket to the relay, authenticates with the
//! long-lived workstation credential, bridges session-manager events to
//! relay frames and routes inbound `send_input` frames back into the
//! manager. Reconnects with exponential backoff starting at one second,
//! doubling, capped at ten attempts.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tether_manager::{SessionEvent, SessionManager};
use tether_protocol::{ClientMessage, ServerMessage, SessionStatus};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("relay rejected the credential: {0}")]
    AuthRejected(String),
    #[error("gave up after {0} failed connection attempts")]
    RetriesExhausted(u32),
}

pub async fn run(
    manager: SessionManager,
    relay_url: String,
    credential: String,
) -> Result<(), RelayClientError> {
    let endpoint = format!("{}/ws/workstation", relay_url.trim_end_matches('/'));
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts: u32 = 0;

    loop {
        match connect_and_bridge(&manager, &endpoint, &credential).await {
            Ok(()) => {
                // Clean disconnect: start the backoff ladder over.
                info!(
                    component = "relay_client",
                    event = "relay.disconnected",
                    "Relay connection closed; reconnecting"
                );
                attempts = 0;
                backoff = INITIAL_BACKOFF;
            }
            Err(BridgeError::AuthRejected(message)) => {
                return Err(RelayClientError::AuthRejected(message));
            }
            Err(BridgeError::Transport(err)) => {
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    return Err(RelayClientError::RetriesExhausted(attempts));
                }
                warn!(
                    component = "relay_client",
                    event = "relay.connect_failed",
                    attempt = attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %err,
                    "Relay connection failed"
                );
            }
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
}

enum BridgeError {
    AuthRejected(String),
    Transport(String),
}

async fn connect_and_bridge(
    manager: &SessionManager,
    endpoint: &str,
    credential: &str,
) -> Result<(), BridgeError> {
    let (stream, _response) = connect_async(endpoint)
        .await
        .map_err(|err| BridgeError::Transport(err.to_string()))?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    send_frame(
        &mut ws_tx,
        &ClientMessage::Auth {
            token: credential.to_string(),
        },
    )
    .await?;

    // First frame decides: auth_ok or auth_error.
    loop {
        let Some(frame) = next_server_frame(&mut ws_rx).await? else {
            return Err(BridgeError::Transport("closed during auth".into()));
        };
        match frame {
            ServerMessage::AuthOk => break,
            ServerMessage::AuthError { message } => {
                return Err(BridgeError::AuthRejected(message));
            }
            other => {
                debug!(
                    component = "relay_client",
                    event = "relay.unexpected_frame",
                    frame = ?other,
                    "Unexpected frame during auth"
                );
            }
        }
    }

    info!(
        component = "relay_client",
        event = "relay.connected",
        endpoint = %endpoint,
        "Relay link established"
    );

    // Subscribe before announcing so no event can slip between the snapshot
    // and the live stream.
    let mut events = manager.subscribe();
    for session in manager.list() {
        send_frame(
            &mut ws_tx,
            &ClientMessage::SessionStart {
                session_id: session.id.clone(),
                name: session.name.clone(),
                cwd: session.cwd.clone(),
            },
        )
        .await?;
        if session.status != SessionStatus::Running {
            send_frame(
                &mut ws_tx,
                &ClientMessage::SessionStatus {
                    session_id: session.id,
                    status: session.status,
                },
            )
            .await?;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(frame) = frame_for_event(event) {
                        send_frame(&mut ws_tx, &frame).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "relay_client",
                        event = "relay.events_lagged",
                        skipped,
                        "Relay client lagged behind the event stream"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            frame = next_server_frame(&mut ws_rx) => match frame? {
                None => return Ok(()),
                Some(ServerMessage::SendInput { session_id, text }) => {
                    let manager = manager.clone();
                    // send_input holds a deliberate gap between the text and
                    // the submit return; don't stall the bridge on it.
                    tokio::spawn(async move {
                        if !manager.send_input(&session_id, &text).await {
                            warn!(
                                component = "relay_client",
                                event = "relay.input_dropped",
                                session_id = %session_id,
                                "Inbound input for unknown or dead session"
                            );
                        }
                    });
                }
                Some(ServerMessage::Error { message }) => {
                    warn!(
                        component = "relay_client",
                        event = "relay.server_error",
                        message = %message,
                        "Relay reported an error"
                    );
                }
                Some(_) => {}
            },
        }
    }
}

fn frame_for_event(event: SessionEvent) -> Option<ClientMessage> {
    match event {
        SessionEvent::Started { id, name, cwd } => Some(ClientMessage::SessionStart {
            session_id: id,
            name,
            cwd,
        }),
        SessionEvent::Renamed { id, name } => Some(ClientMessage::SessionUpdate {
            session_id: id,
            name,
        }),
        SessionEvent::Message {
            id, role, text, ..
        } => Some(ClientMessage::SessionMessage {
            session_id: id,
            role,
            content: text,
        }),
        SessionEvent::TodoList { id, todos } => Some(ClientMessage::SessionTodos {
            session_id: id,
            todos,
        }),
        SessionEvent::Status { id, status } => Some(ClientMessage::SessionStatus {
            session_id: id,
            status,
        }),
        SessionEvent::Ended { id } => Some(ClientMessage::SessionEnd { session_id: id }),
        // Tool traffic and plan-mode flips stay on the workstation.
        SessionEvent::ToolCall { .. }
        | SessionEvent::ToolResult { .. }
        | SessionEvent::Mode { .. } => None,
    }
}

async fn send_frame<S>(ws_tx: &mut S, frame: &ClientMessage) -> Result<(), BridgeError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json =
        serde_json::to_string(frame).map_err(|err| BridgeError::Transport(err.to_string()))?;
    ws_tx
        .send(Message::Text(json))
        .await
        .map_err(|err| BridgeError::Transport(err.to_string()))
}

async fn next_server_frame<S>(ws_rx: &mut S) -> Result<Option<ServerMessage>, BridgeError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws_rx.next().await {
            None => return Ok(None),
            Some(Err(err)) => return Err(BridgeError::Transport(err.to_string())),
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) => {
                    debug!(
                        component = "relay_client",
                        event = "relay.frame_malformed",
                        error = %err,
                        "Skipping malformed relay frame"
                    );
                }
            },
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => {}
        }
    }
}
