//! tally-sr (Stats Reconciliation) - Main entry point
//!
//! Serves the leaderboard, validation and repair endpoints, consumes platform
//! notifications, and offers one-shot `validate` / `repair-all` commands for
//! operators.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tally_common::config::{ConfigSource, TomlConfig};
use tally_common::events::NotificationBus;
use tally_common::store::SqliteStore;
use tally_common::{DataStore, TimedStore};
use tally_sr::repair::RepairBatchOptions;
use tally_sr::triggers::{run_dispatcher, NotificationHandler};
use tally_sr::{build_router, AppState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tally-sr
#[derive(Parser, Debug)]
#[command(name = "tally-sr")]
#[command(about = "Check-in stats reconciliation service")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the config file)
    #[arg(short, long, env = "TALLY_DATABASE")]
    database: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "TALLY_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service and trigger dispatcher (default)
    Serve,
    /// Validate one user and print the report as JSON
    Validate {
        user_id: String,
    },
    /// Check users in bulk and print the batch report as JSON
    RepairAll {
        /// Persist repairs instead of a dry run
        #[arg(long)]
        apply: bool,

        #[arg(long, default_value_t = 100)]
        max_users: usize,

        /// Include anonymous users
        #[arg(long)]
        include_anonymous: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, source) = TomlConfig::load(args.config.as_deref());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("tally_sr={0},tally_common={0},tower_http=info", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Build identification first, before any database work
    info!(
        "Starting tally-sr v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    match &source {
        ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
        ConfigSource::Defaults => info!("No config file found, using defaults"),
        ConfigSource::Fallback { path, reason } => warn!(
            "Config file {} unusable ({}), using defaults",
            path.display(),
            reason
        ),
    }

    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("Database path: {}", config.database_path.display());
    let sqlite = SqliteStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let store: Arc<dyn DataStore> = Arc::new(TimedStore::new(
        Arc::new(sqlite),
        config.stats.store_timeout(),
    ));

    let bus = NotificationBus::new(config.stats.notification_capacity);
    let state = AppState::new(store, bus, config.stats.clone());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state, &config).await,
        Command::Validate { user_id } => {
            let report = state
                .services
                .validator
                .validate(&user_id)
                .await
                .with_context(|| format!("Validation failed for {}", user_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::RepairAll {
            apply,
            max_users,
            include_anonymous,
        } => {
            let options = RepairBatchOptions {
                dry_run: !apply,
                max_users: max_users.clamp(1, config.stats.max_batch_users),
                real_users_only: !include_anonymous,
            };
            let report = state.services.repair.repair_batch(&options).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(state: AppState, config: &TomlConfig) -> Result<()> {
    let handler: Arc<dyn NotificationHandler> = Arc::new(state.services.triggers.clone());
    tokio::spawn(run_dispatcher(handler, state.bus.subscribe()));
    info!("Trigger dispatcher running");

    let app = build_router(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("tally-sr listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
