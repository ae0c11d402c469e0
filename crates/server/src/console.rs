//! Console adapter — mirrors every session to stdout.
//!
//! A debug surface that exercises the adapter contract without a chat
//! platform: banners, messages and task lists print to the terminal.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use tether_adapters::{AdapterConfig, ChatAdapter, ChatPort, PortError};
use tether_manager::{SessionEvent, SessionManager};
use tether_protocol::TodoItem;

struct ConsolePort {
    session_id: String,
}

#[async_trait]
impl ChatPort for ConsolePort {
    async fn post_banner(&self, text: &str) -> Result<(), PortError> {
        println!("[{}] {text}", self.session_id);
        Ok(())
    }

    async fn post_user(&self, text: &str) -> Result<(), PortError> {
        println!("[{}] user: {text}", self.session_id);
        Ok(())
    }

    async fn post_assistant(&self, text: &str, _formatted: bool) -> Result<(), PortError> {
        println!("[{}] assistant: {text}", self.session_id);
        Ok(())
    }

    async fn post_todo_list(&self, todos: &[TodoItem]) -> Result<(), PortError> {
        println!("[{}] tasks:", self.session_id);
        for todo in todos {
            let mark = if todo.completed { "x" } else { " " };
            println!("  [{mark}] {}", todo.text);
        }
        Ok(())
    }

    async fn update_topic(&self, name: &str) -> Result<(), PortError> {
        println!("[{}] now: {name}", self.session_id);
        Ok(())
    }

    async fn attach_image(&self, path: &Path) -> Result<(), PortError> {
        println!("[{}] image: {}", self.session_id, path.display());
        Ok(())
    }

    async fn archive(&self) -> Result<(), PortError> {
        Ok(())
    }
}

/// Watch for new sessions and give each one a console adapter.
pub fn spawn(manager: SessionManager) {
    tokio::spawn(async move {
        let mut events = manager.subscribe();
        // Held-open inbound senders; the console surface has no remote
        // input, but dropping a sender would stop its adapter.
        let mut inbound: HashMap<String, mpsc::Sender<String>> = HashMap::new();

        loop {
            match events.recv().await {
                Ok(SessionEvent::Started { id, .. }) => {
                    let (tx, rx) = mpsc::channel(8);
                    inbound.insert(id.clone(), tx);
                    let port = ConsolePort {
                        session_id: id.clone(),
                    };
                    let adapter = ChatAdapter::new(
                        manager.clone(),
                        port,
                        AdapterConfig::new(id.clone(), "·"),
                    );
                    tokio::spawn(adapter.run(rx));
                    debug!(
                        component = "console",
                        event = "console.adapter_spawned",
                        session_id = %id,
                        "Console adapter attached"
                    );
                }
                Ok(SessionEvent::Ended { id }) => {
                    inbound.remove(&id);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
