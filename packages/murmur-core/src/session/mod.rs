//! Per-connection session engine.
//!
//! Each WebSocket connection runs one [`handle_session`] task: a two-phase
//! state machine (AWAIT_AUTH, then STREAMING) that consumes inbound frames
//! strictly in arrival order. Everything slow (transcription calls, archive
//! uploads) is spawned onto independent tasks, so the frame cadence never
//! waits on an upstream.
//!
//! Outbound writes are serialized through one mpsc channel whose single
//! consumer owns the socket sink; the session worker, ASR tasks and debug
//! emissions all write through cloned [`OutboundSender`]s.

pub mod context;
pub mod messages;
pub mod registry;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::archive::{ArchiveFrame, SessionArchiver};
use crate::asr::UtteranceJob;
use crate::protocol_constants::{
    AUTH_DEADLINE_SECS, CLOSE_POLICY_VIOLATION, OUTBOUND_CHANNEL_CAPACITY, PARSE_ERROR_ECHO_LIMIT,
};
use crate::session::context::{SessionContext, UtteranceSnapshot};
use crate::session::messages::{ClientMessage, ServerMessage};
use crate::session::registry::SessionHandle;
use crate::ticket;
use crate::utils::iso_timestamp;

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Writer
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle for queueing frames onto a connection's single writer.
///
/// Sends after the socket is gone are silently dropped; in-flight ASR tasks
/// outlive their sessions by design.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Message>,
}

impl OutboundSender {
    /// Wraps the sending half of a writer channel.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queues a typed server message.
    pub async fn send(&self, msg: ServerMessage) {
        if let Some(frame) = msg.to_message() {
            let _ = self.tx.send(frame).await;
        }
    }

    /// Queues an untyped JSON frame (the tag-less error replies).
    pub async fn send_raw(&self, value: Value) {
        let _ = self.tx.send(Message::Text(value.to_string().into())).await;
    }

    /// Queues a close frame; the writer stops after delivering it.
    ///
    /// Frames queued before this one are flushed first, so an `auth_error`
    /// reaches the wire ahead of its close. Best-effort only over TCP.
    pub async fn close(&self, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        let _ = self.tx.send(frame).await;
    }
}

/// Drains the writer channel into the socket sink.
async fn run_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
    // Receiver drops here; late senders get errors and give up quietly.
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the session loop should keep reading after a message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Session {
    state: AppState,
    session_id: String,
    ctx: SessionContext,
    archiver: Option<SessionArchiver>,
    outbound: OutboundSender,
}

/// Runs one connection to completion.
pub async fn handle_session(socket: WebSocket, state: AppState, handle: SessionHandle) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    tokio::spawn(run_writer(sink, rx));

    let cancel = handle.cancel_token().clone();
    let mut session = Session {
        state,
        session_id: handle.id().to_string(),
        ctx: SessionContext::new(),
        archiver: None,
        outbound: OutboundSender::new(tx),
    };

    log::info!("[Session] {} connected", session.session_id);

    let auth_deadline = tokio::time::sleep(Duration::from_secs(AUTH_DEADLINE_SECS));
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[Session] {} force-closed", session.session_id);
                break;
            }
            () = &mut auth_deadline, if !session.ctx.authenticated => {
                session
                    .outbound
                    .send(ServerMessage::auth_error("Authentication timeout - connection closed"))
                    .await;
                session
                    .outbound
                    .close(CLOSE_POLICY_VIOLATION, "Authentication timeout")
                    .await;
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if session.on_text(&text).await == Flow::Close {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    session
                        .outbound
                        .send_raw(json!({
                            "error": "Binary frames are not supported",
                            "timestamp": iso_timestamp(),
                        }))
                        .await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {} // Ping/Pong are handled by the protocol layer
            }
        }
    }

    if let Some(archiver) = session.archiver.take() {
        archiver.shutdown().await;
    }

    log::info!(
        "[Session] {} closed after {:.1}s ({} frames)",
        session.session_id,
        session.ctx.connected_at.elapsed().as_secs_f32(),
        session.ctx.frame_count
    );
    // In-flight ASR tasks keep their senders; their replies die with the writer.
}

impl Session {
    async fn on_text(&mut self, text: &str) -> Flow {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.outbound
                    .send_raw(json!({
                        "error": "Failed to parse message as JSON",
                        "parseError": e.to_string(),
                        "receivedData": truncate_for_echo(text),
                        "timestamp": iso_timestamp(),
                    }))
                    .await;
                return Flow::Continue;
            }
        };

        if self.ctx.authenticated {
            self.on_streaming(value).await
        } else {
            self.on_await_auth(value).await
        }
    }

    // ── AWAIT_AUTH ──────────────────────────────────────────────────────────

    async fn on_await_auth(&mut self, value: Value) -> Flow {
        if value.get("type").and_then(Value::as_str) != Some("auth") {
            self.outbound
                .send(ServerMessage::auth_error(
                    "Must authenticate first with auth message",
                ))
                .await;
            self.outbound
                .close(CLOSE_POLICY_VIOLATION, "Authentication required")
                .await;
            return Flow::Close;
        }

        let presented = value
            .get("ticket")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if presented.is_empty() {
            self.outbound
                .send(ServerMessage::auth_error(
                    "Missing ticket in authentication message",
                ))
                .await;
            self.outbound
                .close(CLOSE_POLICY_VIOLATION, "Invalid authentication")
                .await;
            return Flow::Close;
        }

        match ticket::consume(self.state.ticket_store.as_ref(), &presented).await {
            Ok(Some(subject)) => {
                self.ctx.authenticated = true;
                self.ctx.subject = Some(subject.clone());
                self.state
                    .sessions
                    .mark_authenticated(&self.session_id, &subject);
                self.start_archiver();
                self.outbound
                    .send(ServerMessage::AuthSuccess {
                        user_id: subject,
                        timestamp: iso_timestamp(),
                    })
                    .await;
                log::info!(
                    "[Session] {} authenticated with ticket {}…",
                    self.session_id,
                    ticket::redacted(&presented)
                );
                Flow::Continue
            }
            Ok(None) => {
                self.outbound
                    .send(ServerMessage::auth_error("Invalid or expired ticket"))
                    .await;
                self.outbound
                    .close(CLOSE_POLICY_VIOLATION, "Authentication failed")
                    .await;
                Flow::Close
            }
            Err(e) => {
                log::error!("[Session] {} ticket store error: {}", self.session_id, e);
                self.outbound
                    .send(ServerMessage::auth_error("Invalid or expired ticket"))
                    .await;
                self.outbound
                    .close(CLOSE_POLICY_VIOLATION, "Authentication failed")
                    .await;
                Flow::Close
            }
        }
    }

    /// Archival is best-effort: a construction failure downgrades the
    /// session, it never refuses it.
    fn start_archiver(&mut self) {
        match SessionArchiver::new(
            self.session_id.clone(),
            self.state.config.archive.clone(),
            Arc::clone(&self.state.object_store),
        ) {
            Ok(archiver) => self.archiver = Some(archiver),
            Err(e) => {
                log::warn!(
                    "[Session] {} continuing without archival: {}",
                    self.session_id,
                    e
                );
            }
        }
    }

    // ── STREAMING ───────────────────────────────────────────────────────────

    async fn on_streaming(&mut self, value: Value) -> Flow {
        let message = match serde_json::from_value::<ClientMessage>(value.clone()) {
            Ok(message) => message,
            Err(e) => {
                let known = value.get("type").and_then(Value::as_str).is_some_and(|t| {
                    matches!(
                        t,
                        "auth" | "audio_stream_start" | "audio_chunk" | "audio_stream_end"
                    )
                });
                if known {
                    // Recognized type with malformed fields.
                    self.outbound
                        .send_raw(json!({
                            "error": "Failed to parse message as JSON",
                            "parseError": e.to_string(),
                            "receivedData": truncate_for_echo(&value.to_string()),
                            "timestamp": iso_timestamp(),
                        }))
                        .await;
                } else {
                    self.outbound
                        .send_raw(json!({
                            "error": "Unknown message type received",
                            "unknownType": value.get("type").cloned().unwrap_or(Value::Null),
                            "receivedMessage": value,
                            "timestamp": iso_timestamp(),
                        }))
                        .await;
                }
                return Flow::Continue;
            }
        };

        match message {
            ClientMessage::Auth { .. } => {
                // Authentication is monotonic; a second auth is just noise.
                log::debug!("[Session] {} sent auth while streaming", self.session_id);
            }
            ClientMessage::AudioStreamStart => {
                self.ctx.reset_stream();
                self.outbound
                    .send(ServerMessage::AudioStreamStartAck {
                        timestamp: iso_timestamp(),
                        user_id: self.ctx.subject.clone().unwrap_or_default(),
                    })
                    .await;
            }
            ClientMessage::AudioChunk {
                data,
                vad_state,
                vad_offset_ms,
                asr_prompt,
            } => {
                if let Some(prompt) = asr_prompt {
                    self.ctx.last_prompt = Some(prompt);
                }
                let payload = decode_payload(&self.session_id, &data);
                let effects = self.ctx.apply_chunk(payload.clone(), vad_state, vad_offset_ms);

                if effects.vad_cache_start {
                    self.outbound.send(ServerMessage::VadCacheStart).await;
                }

                if let Some(archiver) = &self.archiver {
                    archiver.process(ArchiveFrame {
                        payload,
                        vad_state,
                        vad_offset_ms,
                    });
                }

                if let Some(prefetch) = effects.prefetch {
                    self.submit(prefetch, true);
                }
                if effects.vad_cache_end {
                    self.outbound
                        .send(ServerMessage::VadCacheEnd {
                            timestamp: iso_timestamp(),
                        })
                        .await;
                }
                if let Some(utterance) = effects.final_utterance {
                    self.submit(utterance, false);
                }
            }
            ClientMessage::AudioStreamEnd => {
                self.outbound
                    .send(ServerMessage::AudioStreamEndAck {
                        received_chunks: self.ctx.frame_count,
                        timestamp: iso_timestamp(),
                    })
                    .await;
            }
        }
        Flow::Continue
    }

    fn submit(&self, utterance: UtteranceSnapshot, is_prefetch: bool) {
        self.state.asr.submit(
            UtteranceJob {
                utterance,
                subject: self.ctx.subject.clone().unwrap_or_default(),
                is_prefetch,
                prompt: self.ctx.last_prompt.clone(),
            },
            self.outbound.clone(),
        );
    }
}

/// Decodes a chunk's base64 payload; undecodable data degrades to a
/// timing-only frame rather than killing the session.
fn decode_payload(session_id: &str, data: &str) -> Bytes {
    if data.is_empty() {
        return Bytes::new();
    }
    match BASE64.decode(data.as_bytes()) {
        Ok(pcm) => Bytes::from(pcm),
        Err(e) => {
            log::warn!("[Session] {} undecodable audio payload: {}", session_id, e);
            Bytes::new()
        }
    }
}

/// Truncates unparseable input for echoing back in an error frame.
fn truncate_for_echo(text: &str) -> String {
    text.chars().take(PARSE_ERROR_ECHO_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AppState;
    use crate::state::Config;

    /// Builds a session wired to an observable outbound channel.
    ///
    /// The registry handle is returned alongside so the entry stays live for
    /// the test's duration.
    fn test_session() -> (Session, mpsc::Receiver<Message>, SessionHandle) {
        let state = AppState::for_tests(Config::default());
        let handle = state.sessions.open();
        let (tx, rx) = mpsc::channel(64);
        let session = Session {
            state,
            session_id: handle.id().to_string(),
            ctx: SessionContext::new(),
            archiver: None,
            outbound: OutboundSender::new(tx),
        };
        (session, rx, handle)
    }

    fn frame_json(rx: &mut mpsc::Receiver<Message>) -> Value {
        match rx.try_recv().expect("frame queued") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn expect_close(rx: &mut mpsc::Receiver<Message>, reason: &str) {
        match rx.try_recv().expect("close frame queued") {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.as_str(), reason);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    async fn authenticate(session: &mut Session, rx: &mut mpsc::Receiver<Message>) {
        let issued = ticket::issue(session.state.ticket_store.as_ref(), "user_42")
            .await
            .unwrap();
        let flow = session
            .on_text(&format!(r#"{{"type":"auth","ticket":"{}"}}"#, issued.ticket))
            .await;
        assert_eq!(flow, Flow::Continue);
        let json = frame_json(rx);
        assert_eq!(json["type"], "auth_success");
        assert_eq!(json["userId"], "user_42");
    }

    fn chunk_msg(data: &[u8], vad: Option<(&str, i64)>) -> String {
        let mut value = json!({"type": "audio_chunk", "data": BASE64.encode(data)});
        if let Some((state, offset)) = vad {
            value["vad_state"] = json!(state);
            value["vad_offset_ms"] = json!(offset);
        }
        value.to_string()
    }

    #[tokio::test]
    async fn wrong_first_message_closes_1008() {
        let (mut session, mut rx, _handle) = test_session();
        let flow = session.on_text(r#"{"type":"audio_stream_start"}"#).await;
        assert_eq!(flow, Flow::Close);

        let json = frame_json(&mut rx);
        assert_eq!(json["type"], "auth_error");
        assert_eq!(json["error"], "Must authenticate first with auth message");
        expect_close(&mut rx, "Authentication required");
    }

    #[tokio::test]
    async fn missing_ticket_closes_1008() {
        let (mut session, mut rx, _handle) = test_session();
        let flow = session.on_text(r#"{"type":"auth","ticket":""}"#).await;
        assert_eq!(flow, Flow::Close);

        let json = frame_json(&mut rx);
        assert_eq!(json["error"], "Missing ticket in authentication message");
        expect_close(&mut rx, "Invalid authentication");
    }

    #[tokio::test]
    async fn invalid_ticket_closes_1008() {
        let (mut session, mut rx, _handle) = test_session();
        let flow = session
            .on_text(&format!(r#"{{"type":"auth","ticket":"{}"}}"#, "0".repeat(64)))
            .await;
        assert_eq!(flow, Flow::Close);

        let json = frame_json(&mut rx);
        assert_eq!(json["error"], "Invalid or expired ticket");
        expect_close(&mut rx, "Authentication failed");
    }

    #[tokio::test]
    async fn valid_ticket_authenticates_and_spends_itself() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;
        assert!(session.ctx.authenticated);
        assert_eq!(session.ctx.subject.as_deref(), Some("user_42"));
        assert!(session.archiver.is_some());

        // The registry entry picked up the subject
        let infos = session.state.sessions.snapshot();
        let info = infos
            .iter()
            .find(|i| i.session_id == session.session_id)
            .expect("session registered");
        assert_eq!(info.subject.as_deref(), Some("user_42"));

        // Double-spending the same ticket is covered by the ticket tests;
        // here we just confirm the archiver spun up and nothing else was
        // queued.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn parse_failure_replies_and_keeps_connection() {
        let (mut session, mut rx, _handle) = test_session();
        let flow = session.on_text("{not json").await;
        assert_eq!(flow, Flow::Continue);

        let json = frame_json(&mut rx);
        assert_eq!(json["error"], "Failed to parse message as JSON");
        assert_eq!(json["receivedData"], "{not json");
        assert!(json.get("parseError").is_some());
    }

    #[tokio::test]
    async fn parse_failure_echo_is_truncated() {
        let (mut session, mut rx, _handle) = test_session();
        let long = "x".repeat(300);
        session.on_text(&long).await;
        let json = frame_json(&mut rx);
        assert_eq!(json["receivedData"].as_str().unwrap().chars().count(), 100);
    }

    #[tokio::test]
    async fn unknown_type_replies_and_keeps_connection() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;

        let flow = session.on_text(r#"{"type":"dance","tempo":120}"#).await;
        assert_eq!(flow, Flow::Continue);

        let json = frame_json(&mut rx);
        assert_eq!(json["error"], "Unknown message type received");
        assert_eq!(json["unknownType"], "dance");
        assert_eq!(json["receivedMessage"]["tempo"], 120);
    }

    #[tokio::test]
    async fn stream_start_acks_and_resets() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;

        session.on_text(&chunk_msg(&[0u8; 4096], None)).await;
        assert_eq!(session.ctx.global_time_ms, 128);

        session.on_text(r#"{"type":"audio_stream_start"}"#).await;
        let json = frame_json(&mut rx);
        assert_eq!(json["type"], "audio_stream_start_ack");
        assert_eq!(json["userId"], "user_42");
        assert_eq!(session.ctx.global_time_ms, 0);
    }

    #[tokio::test]
    async fn stream_end_acks_with_received_count() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;

        for _ in 0..3 {
            session.on_text(&chunk_msg(&[0u8; 4096], None)).await;
        }
        session.on_text(r#"{"type":"audio_stream_end"}"#).await;

        let json = frame_json(&mut rx);
        assert_eq!(json["type"], "audio_stream_end_ack");
        assert_eq!(json["receivedChunks"], 3);
    }

    #[tokio::test]
    async fn vad_segment_emits_start_and_end_acks() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;

        session
            .on_text(&chunk_msg(&[0u8; 4096], Some(("start", -64))))
            .await;
        let json = frame_json(&mut rx);
        assert_eq!(json["type"], "vad_cache_start");

        session
            .on_text(&chunk_msg(&[0u8; 4096], Some(("end", 32))))
            .await;
        let json = frame_json(&mut rx);
        assert_eq!(json["type"], "vad_cache_end");

        // The final submission hits the dispatcher with no API key configured,
        // so a transcription_error arrives asynchronously.
        let msg = rx.recv().await.expect("dispatcher replied");
        let json: Value = match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(json["type"], "transcription_error");
        assert_eq!(json["is_prefetch"], false);
    }

    #[tokio::test]
    async fn undecodable_payload_still_advances_the_clock() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;

        session
            .on_text(r#"{"type":"audio_chunk","data":"!!not-base64!!"}"#)
            .await;
        assert_eq!(session.ctx.global_time_ms, 128);
        assert_eq!(session.ctx.preroll_len(), 0);
    }

    #[tokio::test]
    async fn asr_prompt_is_remembered() {
        let (mut session, mut rx, _handle) = test_session();
        authenticate(&mut session, &mut rx).await;

        session
            .on_text(r#"{"type":"audio_chunk","data":"","asr_prompt":"jargon list"}"#)
            .await;
        assert_eq!(session.ctx.last_prompt.as_deref(), Some("jargon list"));
    }
}
