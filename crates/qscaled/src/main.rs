//! qscaled — queue-depth autoscaler daemon.
//!
//! # Usage
//!
//! ```text
//! qscaled run --config /etc/qscale/qscaled.toml --data-dir /var/lib/qscale
//! qscaled check-config --config /etc/qscale/qscaled.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qscale_broker::RedisConnector;
use qscale_state::StateStore;
use qscaled::DaemonConfig;

#[derive(Parser)]
#[command(name = "qscaled", about = "Queue-depth autoscaler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run {
        /// Configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/qscale")]
        data_dir: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Parse and validate a configuration file, then print it resolved.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            run(config, &data_dir).await
        }
        Command::CheckConfig { config } => {
            let config = DaemonConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,qscaled=debug,qscale=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: DaemonConfig, data_dir: &Path) -> anyhow::Result<()> {
    info!("qscale daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let db_path = config.store_path(data_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let connector = Arc::new(RedisConnector::new(config.response_timeout()?));
    let controller = qscaled::assemble(&config, store, connector)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            // Dropping the sender would stop the loop.
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // ── Control loop ───────────────────────────────────────────

    controller.run(shutdown_rx).await;

    info!("qscale daemon stopped");
    Ok(())
}
