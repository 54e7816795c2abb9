//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the ticket, session
//! and store layers. It provides the router construction and server startup
//! functionality.

use std::sync::Arc;

use thiserror::Error;

use crate::asr::AsrDispatcher;
use crate::session::registry::SessionRegistry;
use crate::state::Config;
use crate::store::{HttpObjectStore, MemoryObjectStore, ObjectStore};
use crate::ticket::{MemoryTicketStore, TicketStore};

pub mod http;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to the gateway's few pieces
/// of process-wide state: the ticket store, the object store, the ASR
/// dispatcher and the session registry. Everything else is per-connection.
#[derive(Clone)]
pub struct AppState {
    /// TTL store holding issued tickets.
    pub ticket_store: Arc<dyn TicketStore>,
    /// Blob store for archived audio.
    pub object_store: Arc<dyn ObjectStore>,
    /// Upstream transcription dispatcher.
    pub asr: Arc<AsrDispatcher>,
    /// Registry of live WebSocket sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Process configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the application state from configuration.
    ///
    /// The object store is the HTTP adapter when an endpoint is configured,
    /// the in-process store otherwise; tickets always live in process.
    pub fn new(config: Config) -> Self {
        let object_store: Arc<dyn ObjectStore> =
            match HttpObjectStore::from_config(&config.object_store) {
                Some(store) => {
                    log::info!(
                        "[Server] Archiving to {} (bucket {})",
                        config.object_store.endpoint.as_deref().unwrap_or("?"),
                        config.object_store.bucket.as_deref().unwrap_or("audio")
                    );
                    Arc::new(store)
                }
                None => {
                    log::info!("[Server] No object-store endpoint; archiving in process memory");
                    Arc::new(MemoryObjectStore::new())
                }
            };

        Self {
            ticket_store: Arc::new(MemoryTicketStore::new()),
            object_store,
            asr: Arc::new(AsrDispatcher::new(config.asr.clone())),
            sessions: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
        }
    }

    /// State with in-process stores for unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests(config: Config) -> Self {
        Self {
            ticket_store: Arc::new(MemoryTicketStore::new()),
            object_store: Arc::new(MemoryObjectStore::new()),
            asr: Arc::new(AsrDispatcher::new(config.asr.clone())),
            sessions: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
        }
    }
}

async fn find_available_port(
    start: u16,
    end: u16,
) -> Result<(u16, tokio::net::TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP server on the configured or auto-discovered port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let preferred_port = state.config.preferred_port;
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, tokio::net::TcpListener::bind(&addr).await?)
    } else {
        find_available_port(8750, 8760).await?
    };

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);

    axum::serve(listener, app).await?;
    Ok(())
}
