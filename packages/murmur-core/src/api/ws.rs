//! WebSocket upgrade handling and origin validation.
//!
//! Browsers attach an `Origin` header to upgrade requests; anything outside
//! the configured allowlist (plus localhost) is refused with HTTP 403 before
//! the upgrade completes. Credentials never travel in the URL; the first
//! message on the socket carries the ticket.

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::AppState;
use crate::session;

/// WebSocket upgrade handler (`GET /api/ws`).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());

    if let Some(origin) = origin {
        if !origin_allowed(origin, &state.config.auth.authorized_parties) {
            log::warn!("[WS] Upgrade refused for origin {}", origin);
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    // Non-browser clients send no Origin header; tickets still gate them.

    ws.on_upgrade(move |socket| async move {
        let handle = state.sessions.open();
        session::handle_session(socket, state, handle).await;
    })
    .into_response()
}

/// Checks an `Origin` header value against the allowlist.
///
/// Comparison is by hostname: allowlist entries may be full origins
/// (`https://app.example.com`) or bare hosts. `localhost` and `127.0.0.1`
/// always pass.
pub fn origin_allowed(origin: &str, allowlist: &[String]) -> bool {
    let Some(host) = origin_hostname(origin) else {
        return false;
    };
    if host == "localhost" || host == "127.0.0.1" {
        return true;
    }
    allowlist
        .iter()
        .any(|entry| origin_hostname(entry).is_some_and(|allowed| allowed == host))
}

/// Extracts the hostname from an origin: strips the scheme, then cuts at the
/// first port or path separator.
fn origin_hostname(origin: &str) -> Option<&str> {
    let rest = match origin.find("://") {
        Some(idx) => &origin[idx + 3..],
        None => origin,
    };
    let host = rest
        .split(['/', ':'])
        .next()
        .map(str::trim)
        .filter(|h| !h.is_empty())?;
    Some(host)
}
