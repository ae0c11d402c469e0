//! The adapter event loop.
//!
//! One `ChatAdapter` owns one remote channel bound to one session. It
//! consumes the manager's event stream, drives the platform through
//! [`ChatPort`], and forwards inbound remote text into the session with
//! echo suppression.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use tether_manager::{SessionEvent, SessionManager};
use tether_protocol::{Role, SessionStatus, TodoItem};

use crate::chunk::chunk_text;
use crate::images::scan_image_paths;
use crate::ledger::EchoLedger;

#[derive(Debug, Error)]
pub enum PortError {
    /// The platform rejected the markdown rendering; the adapter retries
    /// the same content unformatted once.
    #[error("markdown rejected")]
    Markdown,
    #[error("post failed: {0}")]
    Post(String),
}

/// The platform SDK seam. One implementation per chat platform; everything
/// here is a single channel/topic bound to one session.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Platform limit for one outbound message, in bytes.
    fn max_message_bytes(&self) -> usize {
        4000
    }

    async fn post_banner(&self, text: &str) -> Result<(), PortError>;
    async fn post_user(&self, text: &str) -> Result<(), PortError>;
    async fn post_assistant(&self, text: &str, formatted: bool) -> Result<(), PortError>;
    async fn post_todo_list(&self, todos: &[TodoItem]) -> Result<(), PortError>;
    async fn update_topic(&self, name: &str) -> Result<(), PortError>;
    async fn attach_image(&self, path: &Path) -> Result<(), PortError>;
    async fn archive(&self) -> Result<(), PortError>;
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub session_id: String,
    /// Mention string for attention banners (platform-specific form).
    pub owner_mention: String,
    /// Minimum gap between outbound posts (~10 msg/s sustained default).
    pub min_post_gap: Duration,
}

impl AdapterConfig {
    pub fn new(session_id: impl Into<String>, owner_mention: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            owner_mention: owner_mention.into(),
            min_post_gap: Duration::from_millis(100),
        }
    }
}

pub struct ChatAdapter<P: ChatPort> {
    manager: SessionManager,
    port: P,
    config: AdapterConfig,
    ledger: EchoLedger,
    cwd: PathBuf,
    last_post: Option<tokio::time::Instant>,
}

impl<P: ChatPort> ChatAdapter<P> {
    pub fn new(manager: SessionManager, port: P, config: AdapterConfig) -> Self {
        let cwd = manager
            .get(&config.session_id)
            .map(|s| PathBuf::from(s.cwd))
            .unwrap_or_default();
        Self {
            manager,
            port,
            config,
            ledger: EchoLedger::new(),
            cwd,
            last_post: None,
        }
    }

    /// Consume session events and inbound remote messages until the session
    /// ends or both sources close.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<String>) {
        let mut events = self.manager.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.session_id() == self.config.session_id => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            component = "adapter",
                            event = "adapter.lagged",
                            session_id = %self.config.session_id,
                            skipped,
                            "Adapter lagged behind the event stream"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = inbound.recv() => match message {
                    Some(text) => self.handle_inbound(text).await,
                    None => break,
                },
            }
        }
    }

    /// Returns `false` once the session is over.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Started { name, cwd, .. } => {
                self.cwd = PathBuf::from(cwd);
                self.post_banner_paced(&format!("▶ {name} started")).await;
            }
            SessionEvent::Ended { .. } => {
                self.post_banner_paced("■ session ended").await;
                if let Err(err) = self.port.archive().await {
                    debug!(
                        component = "adapter",
                        event = "adapter.archive_failed",
                        error = %err,
                        "Channel archive failed"
                    );
                }
                return false;
            }
            SessionEvent::Renamed { name, .. } => {
                if let Err(err) = self.port.update_topic(&name).await {
                    warn!(
                        component = "adapter",
                        event = "adapter.topic_failed",
                        error = %err,
                        "Topic update failed"
                    );
                }
            }
            SessionEvent::Status { status, .. } => {
                if status == SessionStatus::Idle {
                    let banner =
                        format!("{} the session is waiting for you", self.config.owner_mention);
                    self.post_banner_paced(&banner).await;
                }
            }
            SessionEvent::Message { role, text, .. } => match role {
                Role::User => {
                    if self.ledger.consume(&text) {
                        debug!(
                            component = "adapter",
                            event = "adapter.echo_suppressed",
                            session_id = %self.config.session_id,
                            "Dropped echoed user message"
                        );
                    } else {
                        self.post_chunked(&text, PostKind::User).await;
                    }
                }
                Role::Assistant => {
                    self.post_chunked(&text, PostKind::Assistant).await;
                    for image in scan_image_paths(&text, &self.cwd) {
                        self.pace().await;
                        if let Err(err) = self.port.attach_image(&image).await {
                            warn!(
                                component = "adapter",
                                event = "adapter.attach_failed",
                                path = %image.display(),
                                error = %err,
                                "Image attach failed"
                            );
                        }
                    }
                }
            },
            SessionEvent::TodoList { todos, .. } => {
                self.pace().await;
                if let Err(err) = self.port.post_todo_list(&todos).await {
                    warn!(
                        component = "adapter",
                        event = "adapter.todos_failed",
                        error = %err,
                        "Task list post failed"
                    );
                }
            }
            // Tool traffic and mode flips stay off the channel.
            SessionEvent::ToolCall { .. }
            | SessionEvent::ToolResult { .. }
            | SessionEvent::Mode { .. } => {}
        }
        true
    }

    /// Inbound remote text: remember it for echo suppression, forward it
    /// into the session, roll the ledger back if forwarding failed.
    async fn handle_inbound(&mut self, text: String) {
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() {
            return;
        }
        self.ledger.insert(&trimmed);
        if !self.manager.send_input(&self.config.session_id, &text).await {
            self.ledger.consume(&trimmed);
            warn!(
                component = "adapter",
                event = "adapter.input_failed",
                session_id = %self.config.session_id,
                "Input could not be forwarded; ledger entry removed"
            );
        }
    }

    async fn post_chunked(&mut self, text: &str, kind: PostKind) {
        let limit = self.port.max_message_bytes();
        for chunk in chunk_text(text, limit) {
            self.pace().await;
            let result = match kind {
                PostKind::User => self.port.post_user(&chunk).await,
                PostKind::Assistant => match self.port.post_assistant(&chunk, true).await {
                    Err(PortError::Markdown) => self.port.post_assistant(&chunk, false).await,
                    other => other,
                },
            };
            if let Err(err) = result {
                warn!(
                    component = "adapter",
                    event = "adapter.post_failed",
                    session_id = %self.config.session_id,
                    error = %err,
                    "Post failed"
                );
            }
        }
    }

    async fn post_banner_paced(&mut self, text: &str) {
        self.pace().await;
        if let Err(err) = self.port.post_banner(text).await {
            warn!(
                component = "adapter",
                event = "adapter.post_failed",
                session_id = %self.config.session_id,
                error = %err,
                "Post failed"
            );
        }
    }

    /// Keep sustained dispatch under the platform rate limit.
    async fn pace(&mut self) {
        let now = tokio::time::Instant::now();
        if let Some(last) = self.last_post {
            let next_allowed = last + self.config.min_post_gap;
            if next_allowed > now {
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        self.last_post = Some(tokio::time::Instant::now());
    }
}

#[derive(Clone, Copy)]
enum PostKind {
    User,
    Assistant,
}
