//! Tether Server
//!
//! Remote tether for local AI coding sessions: a workstation-side session
//! manager that tails transcripts, and a relay hub that fans the resulting
//! event streams out to remote viewers.

mod cmd_pair;
mod cmd_status;
mod console;
mod logging;
mod paths;
mod relay_client;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tether_manager::{ManagerConfig, RendezvousServer, SessionManager};
use tether_relay::{router, LogPushGateway, RelayConfig, RelayState, TokenStore};

use crate::relay_client::RelayClientError;

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_USAGE: i32 = 1;
const EXIT_AUTH: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "tether-server", version, about = "Remote tether for local AI coding sessions")]
struct Cli {
    /// Data directory (default: ~/.tether, or TETHER_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay fan-out hub
    Relay {
        #[arg(long, default_value = "127.0.0.1:4600")]
        bind: String,
        /// Public base URL used in pairing links (default: http://<bind>)
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Run the workstation session manager
    Manager {
        #[arg(long, default_value = "http://127.0.0.1:4600")]
        relay_url: String,
        /// Workstation credential (default: the saved pairing credential)
        #[arg(long)]
        credential: Option<String>,
        /// Mirror sessions to stdout
        #[arg(long)]
        console: bool,
    },
    /// Obtain a workstation credential via device-code pairing
    Pair {
        #[arg(long, default_value = "http://127.0.0.1:4600")]
        relay_url: String,
    },
    /// Show what is running
    Status {
        #[arg(long, default_value = "http://127.0.0.1:4600")]
        relay_url: String,
    },
    /// Mint a viewer token into the data dir
    GenerateToken {
        #[arg(long, default_value = "default")]
        user: String,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    let result = match cli.command {
        Commands::Status { relay_url } => cmd_status::run(&data_dir, &relay_url),
        Commands::GenerateToken { user } => cmd_status::generate_token(&data_dir, &user),
        command => {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("failed to start runtime: {err}");
                    std::process::exit(EXIT_USAGE);
                }
            };
            runtime.block_on(async_main(command))
        }
    };

    if let Err(err) = result {
        if err.downcast_ref::<RelayClientError>().is_some_and(|e| {
            matches!(e, RelayClientError::AuthRejected(_))
        }) {
            eprintln!("authentication failed: {err}");
            std::process::exit(EXIT_AUTH);
        }
        eprintln!("error: {err}");
        std::process::exit(EXIT_USAGE);
    }
}

async fn async_main(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Relay { bind, base_url } => run_relay(bind, base_url).await,
        Commands::Manager {
            relay_url,
            credential,
            console,
        } => run_manager(relay_url, credential, console).await,
        Commands::Pair { relay_url } => cmd_pair::run(&relay_url).await,
        Commands::Status { .. } | Commands::GenerateToken { .. } => unreachable!("handled in main"),
    }
}

async fn run_relay(bind: String, base_url: Option<String>) -> anyhow::Result<()> {
    let logging = logging::init_logging("relay")?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span = tracing::info_span!("tether_relay", service = "tether-relay", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    paths::ensure_dirs()?;

    let auth = TokenStore::new();
    let mut seeded = 0usize;
    if let Ok(contents) = std::fs::read_to_string(paths::tokens_file_path()) {
        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(user), Some(token)) = (parts.next(), parts.next()) {
                auth.seed_viewer(token, user);
                seeded += 1;
            }
        }
    }
    if seeded == 0 {
        warn!(
            component = "relay",
            event = "relay.no_viewer_tokens",
            "No viewer tokens found; run `tether-server generate-token` first"
        );
    }

    let config = RelayConfig {
        base_url: base_url.unwrap_or_else(|| format!("http://{bind}")),
    };
    let state = Arc::new(RelayState::new(config, auth, Arc::new(LogPushGateway)));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        component = "relay",
        event = "relay.listening",
        bind_address = %bind,
        viewer_tokens = seeded,
        "Relay listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn run_manager(
    relay_url: String,
    credential: Option<String>,
    console: bool,
) -> anyhow::Result<()> {
    let logging = logging::init_logging("manager")?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span =
        tracing::info_span!("tether_manager", service = "tether-manager", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    paths::ensure_dirs()?;

    let manager = SessionManager::new(ManagerConfig::default());
    let rendezvous = RendezvousServer::bind(&paths::socket_path(), manager.clone())?;
    tokio::spawn(async move {
        if let Err(err) = rendezvous.run().await {
            warn!(
                component = "rendezvous",
                event = "rendezvous.stopped",
                error = %err,
                "Rendezvous server stopped"
            );
        }
    });

    std::fs::write(paths::pid_file_path(), std::process::id().to_string())?;

    if console {
        console::spawn(manager.clone());
    }

    let credential = credential.or_else(saved_credential);
    let result = match credential {
        Some(credential) => {
            info!(
                component = "manager",
                event = "manager.relay_bridge_enabled",
                relay_url = %relay_url,
                "Bridging sessions to the relay"
            );
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Ok(()),
                result = relay_client::run(manager, relay_url, credential) => {
                    result.map_err(anyhow::Error::from)
                }
            }
        }
        None => {
            info!(
                component = "manager",
                event = "manager.local_only",
                "No relay credential; sessions stay local (run `tether-server pair`)"
            );
            let _ = tokio::signal::ctrl_c().await;
            Ok(())
        }
    };

    let _ = std::fs::remove_file(paths::pid_file_path());
    result
}

fn saved_credential() -> Option<String> {
    std::fs::read_to_string(paths::credential_file_path())
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
