//! Local rendezvous endpoint for session runners.
//!
//! Runners connect over a unix domain socket and speak newline-delimited
//! JSON: `session_start` / `session_end` inbound, `input` frames outbound.
//! A closed runner connection ends every session it announced.

use std::io;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_protocol::{ManagerMessage, RunnerMessage};

use crate::manager::SessionManager;
use crate::session::SessionAnnounce;

pub struct RendezvousServer {
    listener: UnixListener,
    manager: SessionManager,
}

impl RendezvousServer {
    /// Bind the rendezvous socket, replacing any stale socket file.
    pub fn bind(path: &Path, manager: SessionManager) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(
            component = "rendezvous",
            event = "rendezvous.listening",
            path = %path.display(),
            "Rendezvous socket bound"
        );
        Ok(Self { listener, manager })
    }

    /// Accept runner connections forever.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let manager = self.manager.clone();
            tokio::spawn(async move {
                handle_runner(stream, manager).await;
            });
        }
    }
}

async fn handle_runner(stream: UnixStream, manager: SessionManager) {
    let (read_half, mut write_half) = stream.into_split();

    // Frames queued by the manager are serialized onto the socket by this
    // task; a write failure closes the channel, which `send_input` observes
    // as a failed dispatch.
    let (frame_tx, mut frame_rx) = mpsc::channel::<ManagerMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let mut json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(err) => {
                    warn!(
                        component = "rendezvous",
                        event = "runner.serialize_failed",
                        error = %err,
                        "Failed to serialize runner frame"
                    );
                    continue;
                }
            };
            json.push('\n');
            if write_half.write_all(json.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut announced: Vec<String> = Vec::new();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(
                    component = "rendezvous",
                    event = "runner.read_failed",
                    error = %err,
                    "Runner connection read failed"
                );
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: RunnerMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                debug!(
                    component = "rendezvous",
                    event = "runner.frame_malformed",
                    error = %err,
                    "Skipping malformed runner frame"
                );
                continue;
            }
        };

        match message {
            RunnerMessage::SessionStart {
                id,
                name,
                cwd,
                project_dir,
                command,
            } => {
                let announce = SessionAnnounce {
                    id: id.clone(),
                    name,
                    cwd,
                    project_dir: project_dir.into(),
                    command,
                };
                match manager.register(announce, frame_tx.clone()) {
                    Ok(()) => announced.push(id),
                    Err(err) => {
                        warn!(
                            component = "rendezvous",
                            event = "runner.register_failed",
                            session_id = %id,
                            error = %err,
                            "Session registration failed"
                        );
                    }
                }
            }
            RunnerMessage::SessionEnd { session_id } => {
                announced.retain(|id| id != &session_id);
                manager.end(&session_id);
            }
        }
    }

    // Transport closure ends everything this runner owned.
    for id in announced {
        manager.end(&id);
    }
    writer.abort();
}
