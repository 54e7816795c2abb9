//! WebSocket wire protocol types.
//!
//! All frames are JSON text. Inbound and outbound messages are
//! internally-tagged enums; the two untyped error frames (JSON parse failure
//! and unknown message type) are built ad hoc in the session loop because
//! they carry no `type` tag.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::iso_timestamp;

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// VAD annotations a client may attach to an `audio_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadState {
    /// Speech began; `vad_offset_ms` may be negative (look-behind).
    Start,
    /// Speech ended; `vad_offset_ms` may trim the final chunk.
    End,
    /// Short silence inside an utterance; request a speculative transcript.
    CacheAsrTrigger,
    /// The client retracts its most recent prefetch request.
    CacheAsrDrop,
}

/// Incoming WebSocket message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        ticket: String,
    },
    AudioStreamStart,
    AudioChunk {
        /// Base64 PCM payload; empty means a timing-only frame.
        #[serde(default)]
        data: String,
        #[serde(default)]
        vad_state: Option<VadState>,
        #[serde(default)]
        vad_offset_ms: Option<i64>,
        /// Context hint forwarded to the transcription provider.
        #[serde(default)]
        asr_prompt: Option<String>,
    },
    AudioStreamEnd,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Timing breakdown attached to every successful transcription.
#[derive(Debug, Clone, Serialize)]
pub struct AsrPerformance {
    pub total_processing_ms: u64,
    pub wav_creation_ms: u64,
    pub api_fetch_ms: u64,
    pub worker_timestamp: String,
    pub provider: &'static str,
}

/// Outgoing WebSocket messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: String,
        timestamp: String,
    },
    AuthError {
        error: String,
        timestamp: String,
    },
    AudioStreamStartAck {
        timestamp: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    AudioStreamEndAck {
        #[serde(rename = "receivedChunks")]
        received_chunks: u64,
        timestamp: String,
    },
    VadCacheStart,
    VadCacheEnd {
        timestamp: String,
    },
    TranscriptionResult {
        text: String,
        #[serde(rename = "speechStartTimeMs")]
        speech_start_time_ms: i64,
        #[serde(rename = "speechEndTimeMs")]
        speech_end_time_ms: i64,
        is_prefetch: bool,
        timestamp: String,
        performance: AsrPerformance,
    },
    TranscriptionError {
        error: String,
        details: Value,
        is_prefetch: bool,
        timestamp: String,
    },
    DebugAudio {
        #[serde(rename = "audioData")]
        audio_data: String,
        #[serde(rename = "speechStartTimeMs")]
        speech_start_time_ms: i64,
        #[serde(rename = "speechEndTimeMs")]
        speech_end_time_ms: i64,
        timestamp: String,
    },
}

impl ServerMessage {
    /// Convenience constructor stamping the current time.
    pub fn auth_error(error: impl Into<String>) -> Self {
        Self::AuthError {
            error: error.into(),
            timestamp: iso_timestamp(),
        }
    }

    /// Serializes the message to a WebSocket text message.
    pub fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self)
            .ok()
            .map(|s| Message::Text(s.into()))
    }
}
