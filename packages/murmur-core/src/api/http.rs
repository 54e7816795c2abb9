//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the ticket, auth and store
//! layers. The ticket endpoint is the entry point of every session: a
//! verified user token buys a one-use ticket, spent as the first WebSocket
//! message.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::auth::verify_user_token;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol_constants::{ARCHIVE_KEY_PREFIX, SERVICE_ID};
use crate::ticket;

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RetentionSweepRequest {
    #[serde(rename = "maxAgeDays")]
    max_age_days: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/ws/ticket", post(issue_ticket))
        .route("/api/ws", get(ws_handler))
        .route("/api/sessions", get(list_live_sessions))
        .route("/api/audio-sessions/stats", get(archive_stats))
        .route("/api/audio-sessions/retention-sweep", post(retention_sweep))
        .route(
            "/api/audio-sessions/{session_id}",
            get(list_session_chunks).delete(delete_session),
        )
        .route(
            "/api/audio-sessions/{session_id}/{chunk_index}",
            get(download_chunk),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe: "Is the process running?"
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "provider": state.asr.provider().as_str(),
        "activeSessions": state.sessions.active(),
    }))
}

/// GET /api/sessions
///
/// Lists live audio sessions (anonymous ones included).
async fn list_live_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    authorize(&headers, &state)?;
    Ok(Json(json!({ "sessions": state.sessions.snapshot() })))
}

/// Extracts and verifies the bearer token, returning the subject.
fn authorize(headers: &HeaderMap, state: &AppState) -> GatewayResult<String> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthorized("Missing Authorization header".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| GatewayError::Unauthorized("Missing Authorization header".into()))?;
    verify_user_token(token, &state.config.auth)
}

/// POST /api/ws/ticket
///
/// Exchanges a verified user token for a one-use connection ticket.
async fn issue_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    let subject = authorize(&headers, &state)?;
    let issued = ticket::issue(state.ticket_store.as_ref(), &subject).await?;
    Ok(Json(issued))
}

/// GET /api/audio-sessions/stats
///
/// Object count and total bytes across all archived sessions.
async fn archive_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    authorize(&headers, &state)?;
    let infos = state.object_store.list(ARCHIVE_KEY_PREFIX).await?;
    let total_bytes: usize = infos.iter().map(|i| i.size).sum();
    Ok(Json(json!({
        "objectCount": infos.len(),
        "totalBytes": total_bytes,
    })))
}

/// GET /api/audio-sessions/:session_id
///
/// Lists the archived chunks of one session.
async fn list_session_chunks(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    authorize(&headers, &state)?;
    let prefix = format!("{ARCHIVE_KEY_PREFIX}session_{session_id}_");
    let infos = state.object_store.list(&prefix).await?;
    Ok(Json(json!({ "sessionId": session_id, "chunks": infos })))
}

/// GET /api/audio-sessions/:session_id/:chunk_index
///
/// Downloads one archived WAV chunk.
async fn download_chunk(
    Path((session_id, chunk_index)): Path<(String, u64)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    authorize(&headers, &state)?;
    let key = format!("{ARCHIVE_KEY_PREFIX}session_{session_id}_original_{chunk_index}.wav");
    let stored = state
        .object_store
        .get(&key)
        .await?
        .ok_or_else(|| GatewayError::NotFound(key.clone()))?;
    Ok((
        [(header::CONTENT_TYPE, stored.info.content_type)],
        stored.data,
    )
        .into_response())
}

/// DELETE /api/audio-sessions/:session_id
///
/// Deletes all archived chunks of one session.
async fn delete_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    authorize(&headers, &state)?;
    let prefix = format!("{ARCHIVE_KEY_PREFIX}session_{session_id}_");
    let infos = state.object_store.list(&prefix).await?;
    let mut deleted = 0u64;
    for info in &infos {
        if state.object_store.delete(&info.key).await? {
            deleted += 1;
        }
    }
    log::info!(
        "[Archive] Deleted {} object(s) for session {}",
        deleted,
        session_id
    );
    Ok(Json(json!({ "sessionId": session_id, "deleted": deleted })))
}

/// POST /api/audio-sessions/retention-sweep
///
/// Deletes archived objects whose `uploadedAt` precedes the cutoff.
async fn retention_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RetentionSweepRequest>,
) -> GatewayResult<impl IntoResponse> {
    authorize(&headers, &state)?;
    if !(1..=365).contains(&req.max_age_days) {
        return Err(GatewayError::InvalidRequest(
            "maxAgeDays must be between 1 and 365".into(),
        ));
    }

    let cutoff = Utc::now() - ChronoDuration::days(req.max_age_days);
    let deleted = sweep_older_than(state.object_store.as_ref(), cutoff).await?;
    log::info!(
        "[Archive] Retention sweep removed {} object(s) older than {} day(s)",
        deleted,
        req.max_age_days
    );
    Ok(Json(json!({ "deleted": deleted })))
}

/// Deletes archived objects uploaded before `cutoff`.
///
/// Objects with unparseable `uploadedAt` timestamps are left alone rather
/// than swept.
async fn sweep_older_than(
    store: &dyn crate::store::ObjectStore,
    cutoff: DateTime<Utc>,
) -> GatewayResult<u64> {
    let infos = store.list(ARCHIVE_KEY_PREFIX).await?;
    let mut deleted = 0u64;
    for info in &infos {
        match DateTime::parse_from_rfc3339(&info.metadata.uploaded_at) {
            Ok(at) if at.with_timezone(&Utc) < cutoff => {
                if store.delete(&info.key).await? {
                    deleted += 1;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "[Archive] Sweep skipped {}: bad uploadedAt ({})",
                    info.key,
                    e
                );
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Config;
    use crate::store::{ArchiveMetadata, ObjectStore};
    use bytes::Bytes;

    fn metadata(uploaded_at: &str) -> ArchiveMetadata {
        ArchiveMetadata {
            session_id: "s1".into(),
            audio_type: "original".into(),
            chunk_index: 0,
            chunk_count: 1,
            start_timestamp: uploaded_at.into(),
            end_timestamp: uploaded_at.into(),
            duration_seconds: 60.0,
            uploaded_at: uploaded_at.into(),
        }
    }

    #[tokio::test]
    async fn authorize_requires_bearer_header() {
        let state = AppState::for_tests(Config::default());
        let headers = HeaderMap::new();
        let err = authorize(&headers, &state).unwrap_err();
        assert_eq!(err.to_string(), "Missing Authorization header");

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        let err = authorize(&headers, &state).unwrap_err();
        assert_eq!(err.to_string(), "Missing Authorization header");
    }

    #[tokio::test]
    async fn sweep_deletes_only_objects_past_cutoff() {
        let state = AppState::for_tests(Config::default());
        let old = (Utc::now() - ChronoDuration::days(10)).to_rfc3339();
        let fresh = Utc::now().to_rfc3339();
        state
            .object_store
            .put("audio-sessions/old.wav", Bytes::new(), "audio/wav", &metadata(&old))
            .await
            .unwrap();
        state
            .object_store
            .put("audio-sessions/new.wav", Bytes::new(), "audio/wav", &metadata(&fresh))
            .await
            .unwrap();

        let cutoff = Utc::now() - ChronoDuration::days(7);
        let deleted = sweep_older_than(state.object_store.as_ref(), cutoff)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(state
            .object_store
            .get("audio-sessions/new.wav")
            .await
            .unwrap()
            .is_some());
        assert!(state
            .object_store
            .get("audio-sessions/old.wav")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sweep_leaves_unparseable_timestamps_alone() {
        let state = AppState::for_tests(Config::default());
        state
            .object_store
            .put(
                "audio-sessions/odd.wav",
                Bytes::new(),
                "audio/wav",
                &metadata("not-a-timestamp"),
            )
            .await
            .unwrap();

        let deleted = sweep_older_than(state.object_store.as_ref(), Utc::now())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(state
            .object_store
            .get("audio-sessions/odd.wav")
            .await
            .unwrap()
            .is_some());
    }
}
