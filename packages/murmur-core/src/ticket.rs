//! One-use connection tickets backed by a TTL key-value store.
//!
//! A ticket is a bearer credential: 32 random bytes rendered as 64 lowercase
//! hex chars, exchanged for a verified user token at the HTTP endpoint and
//! spent as the first WebSocket message. Consumption is one-shot: the store
//! deletes the entry before the record is inspected, so no two connections
//! can redeem the same id.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol_constants::{
    TICKET_ID_BYTES, TICKET_KEY_PREFIX, TICKET_LOG_PREFIX, TICKET_TTL_SECS,
};
use crate::utils::now_millis;

/// Stored ticket payload.
#[derive(Debug, Clone)]
pub struct TicketRecord {
    /// Opaque user id from the identity provider's `sub` claim.
    pub subject: String,
    /// Absolute wall-clock expiry (Unix ms).
    pub expires_at_ms: u64,
    /// One-shot consumption flag.
    pub used: bool,
}

/// TTL-keyed blob store holding issued tickets.
///
/// The production deployment can point this at an external KV; the in-process
/// [`MemoryTicketStore`] is the default and what tests use.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Stores a record under `key` with a server-side TTL.
    async fn put(&self, key: &str, record: TicketRecord, ttl: Duration) -> GatewayResult<()>;

    /// Atomically removes and returns the record under `key`.
    ///
    /// Entries past their TTL are treated as absent.
    async fn take(&self, key: &str) -> GatewayResult<Option<TicketRecord>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-Process Store
// ─────────────────────────────────────────────────────────────────────────────

struct StoredTicket {
    record: TicketRecord,
    expires: tokio::time::Instant,
}

/// In-process TTL map.
#[derive(Default)]
pub struct MemoryTicketStore {
    entries: DashMap<String, StoredTicket>,
}

impl MemoryTicketStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops entries whose TTL has elapsed.
    ///
    /// Consumption already removes entries; this sweep only reclaims tickets
    /// that were issued and never presented.
    pub fn purge_expired(&self) {
        let now = tokio::time::Instant::now();
        self.entries.retain(|_, stored| stored.expires > now);
    }

    /// Number of live entries (expired-but-unswept included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn put(&self, key: &str, record: TicketRecord, ttl: Duration) -> GatewayResult<()> {
        // Opportunistic sweep keeps abandoned tickets from accumulating.
        self.purge_expired();
        self.entries.insert(
            key.to_string(),
            StoredTicket {
                record,
                expires: tokio::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn take(&self, key: &str) -> GatewayResult<Option<TicketRecord>> {
        // Remove first: whatever happens next, the entry is gone and a second
        // take of the same key sees nothing.
        let Some((_, stored)) = self.entries.remove(key) else {
            return Ok(None);
        };
        if stored.expires <= tokio::time::Instant::now() {
            return Ok(None);
        }
        Ok(Some(stored.record))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Issue / Consume
// ─────────────────────────────────────────────────────────────────────────────

/// A freshly issued ticket, as returned to the HTTP client.
#[derive(Debug, serde::Serialize)]
pub struct IssuedTicket {
    /// 64 lowercase hex chars.
    pub ticket: String,
    /// Seconds until the ticket expires.
    pub expires_in: u64,
}

/// Generates a cryptographically random ticket id (64 lowercase hex chars).
#[must_use]
pub fn generate_ticket_id() -> String {
    let mut bytes = [0u8; TICKET_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns the loggable prefix of a ticket id.
///
/// Tickets are bearer credentials; only this prefix may appear in logs.
#[must_use]
pub fn redacted(id: &str) -> &str {
    &id[..id.len().min(TICKET_LOG_PREFIX)]
}

fn store_key(id: &str) -> String {
    format!("{TICKET_KEY_PREFIX}{id}")
}

/// Issues a one-use ticket for `subject`.
pub async fn issue(store: &dyn TicketStore, subject: &str) -> GatewayResult<IssuedTicket> {
    let id = generate_ticket_id();
    let record = TicketRecord {
        subject: subject.to_string(),
        expires_at_ms: now_millis() + TICKET_TTL_SECS * 1000,
        used: false,
    };
    store
        .put(&store_key(&id), record, Duration::from_secs(TICKET_TTL_SECS))
        .await
        .map_err(|e| GatewayError::Storage(format!("ticket put failed: {e}")))?;

    log::info!(
        "[Ticket] Issued {}… for subject {} (ttl {}s)",
        redacted(&id),
        subject,
        TICKET_TTL_SECS
    );

    Ok(IssuedTicket {
        ticket: id,
        expires_in: TICKET_TTL_SECS,
    })
}

/// Consumes a ticket, returning its subject if and only if it was live.
///
/// The single success path deletes the entry; expired or already-used
/// records are also deleted and yield `None`.
pub async fn consume(store: &dyn TicketStore, id: &str) -> GatewayResult<Option<String>> {
    let Some(record) = store.take(&store_key(id)).await? else {
        log::info!("[Ticket] {}… not found or expired in store", redacted(id));
        return Ok(None);
    };

    if record.used || now_millis() >= record.expires_at_ms {
        log::info!("[Ticket] {}… rejected (used or past expiry)", redacted(id));
        return Ok(None);
    }

    log::info!(
        "[Ticket] {}… consumed for subject {}",
        redacted(id),
        record.subject
    );
    Ok(Some(record.subject))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_64_lowercase_hex() {
        let id = generate_ticket_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Two draws should essentially never collide
        assert_ne!(id, generate_ticket_id());
    }

    #[test]
    fn redacted_takes_first_eight_chars() {
        assert_eq!(redacted("abcdef0123456789"), "abcdef01");
        assert_eq!(redacted("abc"), "abc");
    }

    #[tokio::test]
    async fn issue_then_consume_returns_subject_once() {
        let store = MemoryTicketStore::new();
        let issued = issue(&store, "user_42").await.unwrap();
        assert_eq!(issued.expires_in, 300);
        assert_eq!(issued.ticket.len(), 64);

        let subject = consume(&store, &issued.ticket).await.unwrap();
        assert_eq!(subject.as_deref(), Some("user_42"));

        // Second presentation loses
        let again = consume(&store, &issued.ticket).await.unwrap();
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn unknown_ticket_is_rejected() {
        let store = MemoryTicketStore::new();
        let subject = consume(&store, &"0".repeat(64)).await.unwrap();
        assert_eq!(subject, None);
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_expires_after_ttl() {
        let store = MemoryTicketStore::new();
        let issued = issue(&store, "user_42").await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;

        let subject = consume(&store, &issued.ticket).await.unwrap();
        assert_eq!(subject, None);
    }

    #[tokio::test]
    async fn pre_used_record_is_rejected_and_deleted() {
        let store = MemoryTicketStore::new();
        let record = TicketRecord {
            subject: "user_7".into(),
            expires_at_ms: now_millis() + 60_000,
            used: true,
        };
        store
            .put("ticket:deadbeef", record, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(consume(&store, "deadbeef").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let store = MemoryTicketStore::new();
        let record = |subject: &str| TicketRecord {
            subject: subject.into(),
            expires_at_ms: now_millis() + 600_000,
            used: false,
        };
        store
            .put("ticket:a", record("a"), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .put("ticket:b", record("b"), Duration::from_secs(600))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        store.purge_expired();

        assert_eq!(store.len(), 1);
        assert!(store.take("ticket:b").await.unwrap().is_some());
    }
}
