//! Replay service for Nier multi-camera recordings
//!
//! Serves synchronized playback sessions and live frame streams over HTTP and
//! websockets.
//!
//! # Usage
//!
//! ```text
//! replay-engine                 # run the server
//! replay-engine inspect <path>  # print a recording summary as JSON
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with REPLAY_)

use replay_engine::config::{LoggingConfig, ReplayConfig};
use replay_engine::container::{ClassifyRules, McapContainer};
use replay_engine::server::{start_server, AppState};
use replay_engine::session::SessionRegistry;

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    // Validate configuration
    config.validate()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [command, path] if command == "inspect" => inspect(&config, path),
        [] => serve(config).await,
        _ => anyhow::bail!("usage: replay-engine [inspect <path>]"),
    }
}

/// Load configuration from files, falling back to the environment.
fn load_config() -> anyhow::Result<ReplayConfig> {
    let config = ReplayConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        ReplayConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("replay_engine={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("tower_http=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

fn inspect(config: &ReplayConfig, path: &str) -> anyhow::Result<()> {
    let container = McapContainer::open(path)?;
    let summary = container
        .summary(&ClassifyRules::from(&config.container))
        .with_context(|| format!("Failed to summarise {}", path))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve(config: ReplayConfig) -> anyhow::Result<()> {
    info!(
        service = "nier-replay",
        version = env!("CARGO_PKG_VERSION"),
        max_cache_count = config.cache.max_cache_count,
        "Starting replay service"
    );

    let sessions = Arc::new(SessionRegistry::new(config.clone()));
    let state = AppState {
        sessions: sessions.clone(),
    };

    let result = start_server(state, &config.server, shutdown_signal()).await;

    // Release players and temporary files
    let released = tokio::task::spawn_blocking(move || sessions.shutdown()).await;
    if let Err(e) = released {
        error!(error = %e, "Failed to release sessions");
    }

    match result {
        Ok(()) => {
            info!("Replay service stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Replay service failed");
            Err(e)
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
