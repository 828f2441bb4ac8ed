use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tollgate::config::{LogFormat, LoggingConfig, StorageBackend, StorageConfig, TollgateConfig};
use tollgate::ratelimit::{CounterStore, Endpoint, RateLimiter, RetentionSweeper};
use tollgate::store::{MemoryCounterStore, PostgresCounterStore};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Per-user quota enforcement")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the retention sweeper periodically until interrupted
    Serve,
    /// Run a single retention sweep
    Sweep,
    /// Print a user's current quota status as JSON
    Status {
        #[arg(long)]
        user: Uuid,
        /// Treat the user as privileged
        #[arg(long)]
        privileged: bool,
        /// Only report this endpoint
        #[arg(long)]
        endpoint: Option<Endpoint>,
    },
    /// Create the counter table and increment function
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = ?config.storage.backend,
        strategy = %config.storage.increment_strategy,
        "Configuration loaded"
    );

    match cli.command {
        Command::Serve => {
            let store = build_store(&config.storage).await?;
            let sweeper = RetentionSweeper::new(store, config.sweeper.retention_days);

            sweeper
                .run_until(
                    Duration::from_secs(config.sweeper.interval_secs),
                    shutdown_signal(),
                )
                .await;
            info!("Tollgate stopped");
        }
        Command::Sweep => {
            let store = build_store(&config.storage).await?;
            let removed = RetentionSweeper::new(store, config.sweeper.retention_days)
                .sweep()
                .await?;
            println!("{}", removed);
        }
        Command::Status {
            user,
            privileged,
            endpoint,
        } => {
            let store = build_store(&config.storage).await?;
            let limiter = RateLimiter::new(store, config.quota_registry()?);

            let output = match endpoint {
                Some(endpoint) => serde_json::to_string_pretty(
                    &limiter.check_quota(user, endpoint, privileged).await,
                )?,
                None => serde_json::to_string_pretty(
                    &limiter.status_for_all_endpoints(user, privileged).await,
                )?,
            };
            println!("{}", output);
        }
        Command::Migrate => {
            if config.storage.backend != StorageBackend::Postgres {
                bail!("migrate requires storage.backend = postgres");
            }
            PostgresCounterStore::connect(&config.storage)
                .await?
                .migrate()
                .await?;
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn build_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.backend {
        StorageBackend::Memory => {
            Arc::new(MemoryCounterStore::with_strategy(config.increment_strategy))
        }
        StorageBackend::Postgres => {
            let store = PostgresCounterStore::connect(config).await?;
            // Unreachable is not fatal; reads fail open until it recovers
            if !store.is_healthy().await {
                warn!("Counter database is not reachable, quota checks will fail open");
            }
            Arc::new(store)
        }
    };
    info!(strategy = %store.strategy(), "Counter store ready");
    Ok(store)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
