//! # Pool Indexer Service
//!
//! Keeps the pool tables in sync with the chain.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin pool_indexer            # loop + operator trigger
//! cargo run --bin pool_indexer -- once    # single tick, then exit
//! cargo run --bin pool_indexer -- serve   # trigger endpoint only
//! cargo run --bin pool_indexer -- status  # checkpoint and row counts
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::File;
use pool_indexer::chain_reader::{ChainReader, EthersChainReader};
use pool_indexer::database::{self, PgDatastore};
use pool_indexer::datastore::Datastore;
use pool_indexer::indexer::{self, Indexer, SharedIndexer};
use pool_indexer::settings::Settings;
use pool_indexer::trigger::{self, AppState};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{watch, Mutex};

#[derive(Parser, Debug)]
#[command(name = "pool_indexer", version, about = "Pool chain-state indexer")]
struct Cli {
    /// Settings file (TOML, extension optional). Defaults to `Config`; a
    /// missing file is not an error.
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Poll continuously and serve the operator trigger when enabled
    Run,
    /// Process one batch and exit
    Once,
    /// Serve the operator trigger only
    Serve,
    /// Print the checkpoint and table counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load(File::with_name(path).required(false)),
        None => Settings::new(),
    }
    .context("failed to load settings")?;

    init_logging(&settings);
    #[cfg(feature = "observability")]
    if let Some(bind) = &settings.metrics.bind {
        pool_indexer::metrics::init_exporter(bind.parse()?)?;
        log::info!("Prometheus exporter listening on {}", bind);
    }

    settings.validate()?;
    let command = cli.command.unwrap_or(Command::Run);
    log::info!(
        "Starting pool indexer ({:?}) on chain {} with factory {}",
        command,
        settings.indexer.chain_id,
        settings.contracts.pool_factory
    );

    let db_pool = database::connect(
        &settings.database.url,
        settings.database.max_connections,
        settings.database.connect_attempts,
    )
    .await?;
    let store: Arc<dyn Datastore> = Arc::new(PgDatastore::new(db_pool));
    let chain: Arc<dyn ChainReader> = Arc::new(EthersChainReader::connect(
        &settings.rpc.url,
        settings.rpc_timeout(),
        settings.rpc.qps_limit,
    )?);
    let mut indexer: Indexer<dyn ChainReader, dyn Datastore> =
        Indexer::new(chain, store, settings.indexer_config()?);

    match command {
        Command::Status => {
            let status = indexer.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Once => {
            let outcome = indexer.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Serve => {
            let shared: SharedIndexer = Arc::new(Mutex::new(indexer));
            let state = AppState::new(shared, settings.trigger_secret());
            trigger::serve(settings.trigger_bind()?, state, shutdown_signal()).await?;
        }
        Command::Run => {
            if !settings.trigger.enabled {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(forward_shutdown(tx));
                indexer.run(rx).await;
                return Ok(());
            }

            let shared: SharedIndexer = Arc::new(Mutex::new(indexer));
            let (tx, rx) = watch::channel(false);
            let loop_handle = tokio::spawn(indexer::run_shared(shared.clone(), rx.clone()));

            let state = AppState::new(shared, settings.trigger_secret());
            let mut server_rx = rx;
            let server = trigger::serve(settings.trigger_bind()?, state, async move {
                let _ = server_rx.changed().await;
            });
            tokio::spawn(forward_shutdown(tx));

            server.await?;
            loop_handle.await?;
        }
    }

    log::info!("Pool indexer stopped");
    Ok(())
}

fn init_logging(settings: &Settings) {
    #[cfg(feature = "observability")]
    if settings.log.json {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(&settings.log.level)),
            )
            .init();
        return;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.as_str()),
    )
    .init();
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

async fn forward_shutdown(tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = tx.send(true);
    // keep the channel open so receivers observe `true` rather than a closed sender
    tx.closed().await;
}
