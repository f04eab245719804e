//! Curio sample host - drives the dispatch engine from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use curio_config_and_utils::{init_logging, Config, Paths};
use curio_database::AsyncDatabase;
use curio_dispatch::store::DurableStore;
use curio_dispatch::{CurioClient, EndSession, QueueKind, StaticFeatures};
use tracing::info;

/// Curio sample command-line interface.
#[derive(Parser)]
#[command(name = "curio-sample")]
#[command(about = "Send a scripted analytics session through the Curio dispatch engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for config, logs and the queue database. Defaults to ~/.curio
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scripted session: a screen, an event and the session end
    Run {
        /// Visitor code sent with every request
        #[arg(long, default_value = "sample-visitor")]
        visitor: String,

        /// Start disconnected so everything is captured in the offline store
        #[arg(long)]
        offline: bool,
    },
    /// Show how many records wait in each durable store
    Status,
    /// Start a session to replay offline records and release the periodic batch
    Flush {
        #[arg(long, default_value = "sample-visitor")]
        visitor: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    init_logging(&cli.log_level, Some(&paths));

    let config = Config::load(&paths).context("loading config")?;

    match cli.command {
        Some(Commands::Run { visitor, offline }) => run(config, paths, visitor, offline).await?,
        None => run(config, paths, "sample-visitor".to_string(), false).await?,
        Some(Commands::Status) => status(&paths).await?,
        Some(Commands::Flush { visitor }) => flush(config, paths, visitor).await?,
    }

    Ok(())
}

async fn open_client(config: Config, paths: Paths, connected: bool, visitor: &str) -> anyhow::Result<CurioClient> {
    let features = StaticFeatures::new(config.api_key.clone(), config.tracking_code.clone(), visitor);
    let client = CurioClient::builder(config)
        .paths(paths)
        .connected(connected)
        .build()
        .await
        .context("starting dispatch engine")?;
    client.mark_ready(features);
    Ok(client)
}

async fn run(config: Config, paths: Paths, visitor: String, offline: bool) -> anyhow::Result<()> {
    let client = open_client(config, paths, !offline, &visitor).await?;

    client.start_session();
    client.start_screen("home", "Home", "/home");
    client.send_event("sample", "run");
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.end_screen("home");
    client.end_event("sample", "run", 500);

    match client.end_session_flushed().await {
        EndSession::Sent => info!("Session ended"),
        other => info!(result = ?other, "Session not ended"),
    }
    client.persisted().await?;

    let offline_left = client.pending_records(QueueKind::Offline).await?;
    client.shutdown().await;
    println!("Session done, {offline_left} record(s) held offline");
    Ok(())
}

async fn status(paths: &Paths) -> anyhow::Result<()> {
    let db = AsyncDatabase::open(&paths.database_file()).await?;
    for kind in [QueueKind::Offline, QueueKind::Periodic] {
        let pending = DurableStore::new(db.clone(), kind).len().await?;
        println!("{:<10} {pending}", kind.as_str());
    }
    db.close().await?;
    Ok(())
}

async fn flush(config: Config, paths: Paths, visitor: String) -> anyhow::Result<()> {
    let client = open_client(config, paths, true, &visitor).await?;
    client.start_session();

    // Offline records drain once the session start is confirmed.
    for _ in 0..50 {
        if client.pending_records(QueueKind::Offline).await? == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    client.set_periodic_dispatch(true);
    let released = match client.tick_periodic_dispatch() {
        Some(handle) => handle.released().await,
        None => 0,
    };
    let offline_left = client.pending_records(QueueKind::Offline).await?;
    client.shutdown().await;
    println!("Released {released} periodic record(s), {offline_left} offline record(s) left");
    Ok(())
}
