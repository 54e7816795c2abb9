//! Murmur Server - Standalone headless server for the Murmur gateway.
//!
//! This binary runs the realtime audio ingestion and transcription gateway
//! as a background daemon: ticket issuance over HTTP, audio sessions over
//! WebSocket, archival to the configured object store.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use murmur_core::{start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Murmur Server - Headless realtime transcription gateway.
#[derive(Parser, Debug)]
#[command(name = "murmur-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "MURMUR_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "MURMUR_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Murmur Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    let core_config = config.to_core_config();
    core_config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid configuration")?;

    log::info!(
        "Configuration: bind_port={}, provider={}, archival={}",
        config.bind_port,
        if core_config.asr.use_fireworks {
            "fireworks"
        } else {
            "groq"
        },
        core_config.archive.store_original_audio
    );
    if core_config.auth.jwt_public_key.is_none() {
        log::warn!("CLERK_JWT_KEY not set - the ticket endpoint will refuse all requests");
    }

    let state = AppState::new(core_config);

    // Spawn the HTTP/WebSocket server
    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Signal every live session to close; each flushes its archiver on the
    // way out.
    let closed = state.sessions.drain();
    if closed > 0 {
        // Give the final flushes a moment before tearing the process down.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }

    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
