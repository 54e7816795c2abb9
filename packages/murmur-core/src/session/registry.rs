//! Registry of live audio sessions.
//!
//! The registry answers two questions the rest of the gateway keeps asking:
//! who is connected right now (the health and admin endpoints report it),
//! and how do we tell every session to wind down on shutdown (each session
//! flushes its archiver on the way out, so a plain task abort would lose
//! the tail of the recording).
//!
//! A session appears here from WebSocket accept to disconnect. Its entry
//! starts anonymous and gains a subject once the ticket is redeemed; the id
//! is a UUID because it doubles as the `session_{id}` portion of archive
//! object keys.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registry entry for one live connection.
struct LiveSession {
    /// Subject from the redeemed ticket; `None` until authentication.
    subject: Option<String>,
    opened_at: Instant,
    /// Wind-down signal for this session's receive loop.
    cancel: CancellationToken,
}

/// Point-in-time view of a live session, as reported by the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub subject: Option<String>,
    pub uptime_seconds: u64,
    pub authenticated: bool,
}

/// Tracks every live audio session in the process.
pub struct SessionRegistry {
    live: DashMap<String, LiveSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
        }
    }

    /// Admits a new connection, returning its handle.
    ///
    /// The entry lives until the handle drops, which the session loop
    /// guarantees even on panic.
    pub fn open(self: &Arc<Self>) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.live.insert(
            id.clone(),
            LiveSession {
                subject: None,
                opened_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        log::info!("[Registry] Session {} opened ({} live)", id, self.live.len());
        SessionHandle {
            id,
            registry: Arc::clone(self),
            cancel,
        }
    }

    /// Records the subject a session authenticated as.
    pub fn mark_authenticated(&self, id: &str, subject: &str) {
        if let Some(mut entry) = self.live.get_mut(id) {
            entry.subject = Some(subject.to_string());
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.live.len()
    }

    /// Snapshot of every live session, anonymous ones included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .live
            .iter()
            .map(|entry| SessionInfo {
                session_id: entry.key().clone(),
                subject: entry.value().subject.clone(),
                uptime_seconds: entry.value().opened_at.elapsed().as_secs(),
                authenticated: entry.value().subject.is_some(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Signals every live session to wind down; returns how many were told.
    ///
    /// Sessions leave the registry themselves as their loops exit and
    /// archivers flush; this only delivers the signal.
    pub fn drain(&self) -> usize {
        let mut signalled = 0;
        for entry in self.live.iter() {
            entry.value().cancel.cancel();
            signalled += 1;
        }
        if signalled > 0 {
            log::info!("[Registry] Draining {} live session(s)", signalled);
        }
        signalled
    }

    fn close(&self, id: &str) {
        if self.live.remove(id).is_some() {
            log::info!(
                "[Registry] Session {} closed ({} remaining)",
                id,
                self.live.len()
            );
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A live session's claim on the registry.
///
/// Holds the session id used in archive keys and the wind-down token the
/// receive loop selects on. Dropping the handle removes the entry.
pub struct SessionHandle {
    id: String,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// The session id (also the `session_{id}` of this session's archive keys).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the gateway wants this session gone.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.close(&self.id);
    }
}
