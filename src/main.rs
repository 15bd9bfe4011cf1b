mod auth;
mod config;
mod git;
mod ssh;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{Authenticator, FileIdentityStore};
use crate::config::Config;
use crate::git::{ProcessSpawner, RepositoryLocator};
use crate::ssh::Dispatcher;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "Git-over-SSH gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every connection.
pub struct AppState {
    pub config: Arc<Config>,
    pub authenticator: Authenticator,
    pub dispatcher: Dispatcher,
    /// Parent of every session's cancel token; fired on SIGINT/SIGTERM.
    pub shutdown: CancellationToken,
    /// Exec tasks still bridging a subprocess.
    pub tasks: TaskTracker,
}

impl AppState {
    fn new(config: Arc<Config>) -> Result<Self> {
        let store = FileIdentityStore::load(&config.identities.path)?;
        let authenticator = Authenticator::new(Arc::new(store));

        let dispatcher = Dispatcher::new(
            RepositoryLocator::new(&config.repositories.root),
            Arc::new(ProcessSpawner),
        )
        .with_programs(&config.process.upload_pack, &config.process.receive_pack)
        .with_shutdown_grace(Duration::from_secs(config.process.shutdown_grace));

        Ok(Self {
            config,
            authenticator,
            dispatcher,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- App state ----
    let state = Arc::new(AppState::new(Arc::clone(&config))?);
    let grace = Duration::from_secs(config.process.shutdown_grace);
    tracing::info!(
        root = %config.repositories.root.display(),
        upload_pack = %config.process.upload_pack,
        receive_pack = %config.process.receive_pack,
        "repositories configured"
    );

    // ---- Serve until signalled ----
    // Dropping the server future only stops the accept loop; sessions run on
    // their own tasks and are wound down through the shutdown token.
    tokio::select! {
        res = ssh::start_ssh_server(Arc::clone(&state)) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "SSH server failed");
                return Err(e);
            }
        }
        () = shutdown_signal() => {}
    }

    // ---- Drain in-flight git commands ----
    state.shutdown.cancel();
    state.tasks.close();
    tracing::info!(
        in_flight = state.tasks.len(),
        grace_secs = grace.as_secs(),
        "waiting for git commands to finish"
    );
    // Each bridge kills its child once the grace runs out; the extra margin
    // covers reaping and the final channel writes.
    if tokio::time::timeout(grace + Duration::from_secs(5), state.tasks.wait())
        .await
        .is_err()
    {
        tracing::warn!(remaining = state.tasks.len(), "git commands still running at exit");
    }

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
