//! Central path resolution for all Tether data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `TETHER_DATA_DIR` env > `~/.tether`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `TETHER_DATA_DIR` env > `~/.tether` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("TETHER_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".tether")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Rendezvous socket for session runners.
pub fn socket_path() -> PathBuf {
    data_dir().join("tether.sock")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("tether.pid")
}

/// Viewer principal tokens consumed by the relay (one `user token` pair per line).
pub fn tokens_file_path() -> PathBuf {
    data_dir().join("auth-tokens")
}

/// Long-lived workstation credential obtained through pairing.
pub fn credential_file_path() -> PathBuf {
    data_dir().join("relay-credential")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
