//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the wire contract with clients (audio format,
//! frame cadence, authentication deadlines) and changing them would break
//! deployed capture frontends.

// ─────────────────────────────────────────────────────────────────────────────
// Audio Format
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of all ingested and archived audio (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Number of audio channels (mono).
pub const CHANNELS: u16 = 1;

/// Bit depth of all ingested PCM.
pub const BITS_PER_SAMPLE: u16 = 16;

/// PCM bytes per millisecond at 16 kHz / 16-bit / mono.
///
/// 16000 samples/s × 2 bytes / 1000 ms. Used to convert the client's
/// `vad_offset_ms` values into byte counts.
pub const PCM_BYTES_PER_MS: usize = 32;

/// Contractual duration of one `audio_chunk` (ms).
///
/// The session clock advances by exactly this much per chunk, regardless of
/// the payload size actually delivered.
pub const FRAME_DURATION_MS: u64 = 128;

/// Nominal payload size of one full chunk (bytes): 128 ms at 32 bytes/ms.
pub const FRAME_BYTES: usize = FRAME_DURATION_MS as usize * PCM_BYTES_PER_MS;

/// Capacity of the per-session preroll ring buffer (bytes): 256 ms of audio.
///
/// Look-behind recovery for negative `vad_offset_ms` values never reaches
/// further back than this.
pub const PREROLL_CAPACITY_BYTES: usize = 8192;

/// Size of the RIFF/WAVE header prepended to assembled utterances.
pub const WAV_HEADER_LEN: usize = 44;

/// MIME type for archived and dispatched audio.
pub const AUDIO_WAV: &str = "audio/wav";

// ─────────────────────────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────────────────────────

/// Seconds a connection may stay unauthenticated before it is closed.
pub const AUTH_DEADLINE_SECS: u64 = 5;

/// Server-side TTL of an issued ticket (seconds).
pub const TICKET_TTL_SECS: u64 = 300;

/// Number of random bytes in a ticket id (rendered as 64 hex chars).
pub const TICKET_ID_BYTES: usize = 32;

/// How many leading hex chars of a ticket may appear in logs.
///
/// Tickets are bearer credentials; the full id must never be logged.
pub const TICKET_LOG_PREFIX: usize = 8;

/// Key prefix for ticket entries in the TTL store.
pub const TICKET_KEY_PREFIX: &str = "ticket:";

/// WebSocket close code used for every authentication failure.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

// ─────────────────────────────────────────────────────────────────────────────
// Archival
// ─────────────────────────────────────────────────────────────────────────────

/// Key prefix for archived audio chunks in the object store.
pub const ARCHIVE_KEY_PREFIX: &str = "audio-sessions/";

/// Default sliding-window span kept in memory per session (ms).
pub const DEFAULT_ARCHIVE_WINDOW_MS: u64 = 120_000;

/// Default interval between scheduled archive uploads (ms).
pub const DEFAULT_ARCHIVE_UPLOAD_INTERVAL_MS: u64 = 60_000;

/// Default in-memory budget for a session's window (MB).
pub const DEFAULT_ARCHIVE_MAX_MEMORY_MB: f64 = 10.0;

/// Interval of the window-eviction sweep that runs even when no frames arrive.
pub const ARCHIVE_CLEANUP_INTERVAL_SECS: u64 = 30;

/// Bounded wait for the final flush performed during archiver shutdown.
pub const ARCHIVE_FINAL_UPLOAD_TIMEOUT_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Session Plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the per-connection outbound write channel.
///
/// Sized for bursts of transcription results plus debug audio blobs without
/// back-pressuring the session worker.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Truncation limit applied to unparseable inbound payloads echoed back in
/// error frames.
pub const PARSE_ERROR_ECHO_LIMIT: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "murmur-gateway";
