//! Per-connection session state and the audio-chunk state transition.
//!
//! [`SessionContext::apply_chunk`] is the heart of the gateway: it advances
//! the contractual 128 ms frame clock, maintains the utterance cache and the
//! preroll ring, and reports which client notifications and ASR submissions
//! the chunk produced. Keeping it free of sockets and tasks makes the VAD
//! arithmetic directly testable.

use bytes::Bytes;
use tokio::time::Instant;

use crate::audio::{offset_bytes, RingBuffer};
use crate::protocol_constants::{FRAME_DURATION_MS, PREROLL_CAPACITY_BYTES};
use crate::session::messages::VadState;

/// An utterance captured between VAD boundaries, ready for dispatch.
#[derive(Debug, Clone)]
pub struct UtteranceSnapshot {
    /// Ordered PCM segments; independent of future cache mutations.
    pub segments: Vec<Bytes>,
    pub speech_start_ms: i64,
    pub speech_end_ms: i64,
}

impl UtteranceSnapshot {
    /// Total PCM bytes across all segments.
    #[must_use]
    pub fn pcm_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }
}

/// What a single `audio_chunk` produced.
#[derive(Debug, Default)]
pub struct ChunkEffects {
    /// Emit `vad_cache_start` to the client.
    pub vad_cache_start: bool,
    /// Emit `vad_cache_end` to the client.
    pub vad_cache_end: bool,
    /// Speculative submission (`is_prefetch = true`); the cache lives on.
    pub prefetch: Option<UtteranceSnapshot>,
    /// Final submission (`is_prefetch = false`); the cache was cleared.
    pub final_utterance: Option<UtteranceSnapshot>,
}

/// Per-connection ephemeral state.
pub struct SessionContext {
    /// Opaque user id; set once on successful auth, immutable after.
    pub subject: Option<String>,
    /// Flips false→true at most once, never back.
    pub authenticated: bool,
    pub connected_at: Instant,
    pub frame_count: u64,
    /// `frame_count × 128`; advanced exactly once per chunk regardless of
    /// payload size.
    pub global_time_ms: u64,
    caching: bool,
    utterance_cache: Vec<Bytes>,
    preroll: RingBuffer,
    speech_start_ms: i64,
    /// Set by `cache_asr_drop`; swallows the next prefetch of this utterance.
    prefetch_suppressed: bool,
    /// Most recent `asr_prompt` seen on this stream.
    pub last_prompt: Option<String>,
}

impl SessionContext {
    /// Creates the state for a freshly accepted connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subject: None,
            authenticated: false,
            connected_at: Instant::now(),
            frame_count: 0,
            global_time_ms: 0,
            caching: false,
            utterance_cache: Vec::new(),
            preroll: RingBuffer::new(PREROLL_CAPACITY_BYTES),
            speech_start_ms: 0,
            prefetch_suppressed: false,
            last_prompt: None,
        }
    }

    /// Resets all stream-scoped state (`audio_stream_start`).
    ///
    /// Idempotent; authentication and identity are untouched.
    pub fn reset_stream(&mut self) {
        self.frame_count = 0;
        self.global_time_ms = 0;
        self.caching = false;
        self.utterance_cache.clear();
        self.preroll.clear();
        self.speech_start_ms = 0;
        self.prefetch_suppressed = false;
    }

    /// True while an utterance is being accumulated.
    #[must_use]
    pub fn caching(&self) -> bool {
        self.caching
    }

    /// Bytes currently held in the utterance cache.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.utterance_cache.iter().map(Bytes::len).sum()
    }

    /// Bytes currently held in the preroll ring.
    #[must_use]
    pub fn preroll_len(&self) -> usize {
        self.preroll.len()
    }

    /// Processes one `audio_chunk`.
    ///
    /// Speech boundary timestamps are computed against the frame clock as it
    /// stood when the chunk arrived; the clock then advances by 128 ms.
    pub fn apply_chunk(
        &mut self,
        payload: Bytes,
        vad_state: Option<VadState>,
        vad_offset_ms: Option<i64>,
    ) -> ChunkEffects {
        let mut effects = ChunkEffects::default();
        self.frame_count += 1;
        let frame_time_ms = self.global_time_ms as i64;
        let offset = vad_offset_ms.unwrap_or(0);

        if vad_state == Some(VadState::Start) {
            self.caching = true;
            self.utterance_cache.clear();
            self.prefetch_suppressed = false;
            self.speech_start_ms = frame_time_ms + offset;
            if offset < 0 {
                // Look-behind: recover up to |offset| ms from the preroll.
                // The ring clamps to whatever it actually holds.
                let recovered = self.preroll.tail(offset_bytes(offset));
                if !recovered.is_empty() {
                    self.utterance_cache.push(Bytes::from(recovered));
                }
            }
            effects.vad_cache_start = true;
        }

        if self.caching && !payload.is_empty() && vad_state != Some(VadState::End) {
            self.utterance_cache.push(payload.clone());
        }

        // Preroll is fed unconditionally; it must already hold this chunk by
        // the time a future start frame looks behind.
        if !payload.is_empty() {
            self.preroll.append(&payload);
        }

        match vad_state {
            Some(VadState::CacheAsrTrigger) if self.caching => {
                if self.prefetch_suppressed {
                    // A preceding drop retracted this prefetch.
                    self.prefetch_suppressed = false;
                } else {
                    let mut segments = self.utterance_cache.clone();
                    if !payload.is_empty() {
                        segments.push(Self::offset_prefix(&payload, vad_offset_ms));
                    }
                    effects.prefetch = Some(UtteranceSnapshot {
                        segments,
                        speech_start_ms: self.speech_start_ms,
                        speech_end_ms: frame_time_ms + offset,
                    });
                }
            }
            Some(VadState::CacheAsrDrop) if self.caching => {
                self.prefetch_suppressed = true;
            }
            Some(VadState::End) if self.caching => {
                if !payload.is_empty() {
                    self.utterance_cache
                        .push(Self::offset_prefix(&payload, vad_offset_ms));
                }
                self.caching = false;
                self.prefetch_suppressed = false;
                let segments = std::mem::take(&mut self.utterance_cache);
                effects.vad_cache_end = true;
                effects.final_utterance = Some(UtteranceSnapshot {
                    segments,
                    speech_start_ms: self.speech_start_ms,
                    speech_end_ms: frame_time_ms + offset,
                });
            }
            _ => {}
        }

        self.global_time_ms += FRAME_DURATION_MS;
        effects
    }

    /// The portion of a boundary chunk that belongs to the utterance: its
    /// first `offset × 32` bytes for a positive offset (clamped to the
    /// payload), or the whole chunk otherwise.
    fn offset_prefix(payload: &Bytes, vad_offset_ms: Option<i64>) -> Bytes {
        match vad_offset_ms {
            Some(off) if off > 0 => payload.slice(..offset_bytes(off).min(payload.len())),
            _ => payload.clone(),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}
