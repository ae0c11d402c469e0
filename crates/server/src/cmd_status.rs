//! `tether-server status` — check what is running.
//! `tether-server generate-token` — create a viewer token.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::paths;
use crate::VERSION;

pub fn run(data_dir: &Path, relay_url: &str) -> anyhow::Result<()> {
    println!();
    println!("  Tether v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    // Check PID file
    let pid_path = paths::pid_file_path();
    let pid_alive = if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path).unwrap_or_default();
        let pid: u32 = pid_str.trim().parse().unwrap_or(0);
        if pid > 0 && process_alive(pid) {
            println!("  PID: {} (running)", pid);
            true
        } else {
            println!("  PID file: {} (stale — process not found)", pid);
            false
        }
    } else {
        println!("  PID file: not found");
        false
    };

    // Rendezvous socket
    let socket = paths::socket_path();
    if socket.exists() {
        println!("  Runner socket: {}", socket.display());
    } else {
        println!("  Runner socket: not bound");
    }

    // Relay health probe
    let health_ok = check_health(relay_url);
    if health_ok {
        println!("  Relay: OK ({relay_url}/health)");
    } else {
        println!("  Relay: unreachable ({relay_url}/health)");
    }

    // Workstation credential
    if paths::credential_file_path().exists() {
        println!("  Relay credential: present");
    } else {
        println!("  Relay credential: none (run `tether-server pair`)");
    }

    println!();

    if !pid_alive && !health_ok {
        println!("  Nothing is running.");
        println!("  Start with: tether-server manager  (or: tether-server relay)");
        println!();
    }

    Ok(())
}

pub fn generate_token(data_dir: &Path, user: &str) -> anyhow::Result<()> {
    let token = uuid::Uuid::new_v4().to_string();
    let tokens_path = paths::tokens_file_path();

    // Ensure data dir exists
    std::fs::create_dir_all(data_dir)?;

    let mut contents = std::fs::read_to_string(&tokens_path).unwrap_or_default();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&format!("{user} {token}\n"));
    std::fs::write(&tokens_path, &contents)?;
    std::fs::set_permissions(&tokens_path, std::fs::Permissions::from_mode(0o600))?;

    println!();
    println!("  Viewer token for '{user}' saved to {}", tokens_path.display());
    println!();
    println!("  Token: {}", token);
    println!();
    println!("  The relay picks it up on next start:");
    println!("    tether-server relay");
    println!();

    Ok(())
}

fn process_alive(pid: u32) -> bool {
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn check_health(relay_url: &str) -> bool {
    // Use a quick blocking HTTP check (this runs outside tokio)
    std::process::Command::new("curl")
        .args([
            "-s",
            "--connect-timeout",
            "1",
            "--max-time",
            "2",
            &format!("{relay_url}/health"),
        ])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
