//! Coordinator binary

use clap::{Parser, Subcommand};
use minifleet::{Config, DeploymentMode, Node};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minifleet-coord")]
#[command(about = "minifleet coordinator with Raft consensus", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a coordinator node
    Serve {
        /// Node ID (overrides the config file)
        #[arg(long)]
        id: Option<String>,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for snapshots and raft logs
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Deployment mode: fleet or session_pool
        #[arg(long)]
        mode: Option<DeploymentMode>,

        /// Members of the in-process consensus group
        #[arg(long, default_value = "3")]
        replicas: usize,
    },
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received SIGINT"),
            _ = terminate => tracing::info!("Received SIGTERM"),
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            config,
            data_dir,
            mode,
            replicas,
        } => {
            // File and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(mode) = mode {
                config.mode = mode;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            tracing::info!(version = minifleet::VERSION, "Starting minifleet coordinator");

            let token = CancellationToken::new();
            spawn_signal_handler(token.clone());

            let node = Node::start(config, replicas, token).await?;
            node.serve().await?;
        }
    }

    Ok(())
}
