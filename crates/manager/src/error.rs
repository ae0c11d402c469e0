use thiserror::Error;

/// Errors surfaced by the session manager
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session already registered: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
}
