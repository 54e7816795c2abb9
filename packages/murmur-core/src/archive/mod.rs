//! Per-session sliding-window audio archival.
//!
//! Every authenticated session owns a [`SessionArchiver`]: frames fan out to
//! it after the transcription path has taken its copy, accumulate in a
//! time-bounded window, and are periodically snapshotted into WAV chunks and
//! uploaded to the object store. Archival is strictly best-effort: upload
//! failures bump a counter and wait for the next tick; nothing on this path
//! may interrupt transcription.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::assemble_wav;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol_constants::{
    ARCHIVE_CLEANUP_INTERVAL_SECS, ARCHIVE_FINAL_UPLOAD_TIMEOUT_SECS, ARCHIVE_KEY_PREFIX,
    AUDIO_WAV, FRAME_DURATION_MS,
};
use crate::session::messages::VadState;
use crate::state::ArchiveConfig;
use crate::store::{ArchiveMetadata, ObjectStore};
use crate::utils::{iso_from_millis, iso_timestamp, now_millis};

/// A frame forwarded from the session worker.
#[derive(Debug, Clone)]
pub struct ArchiveFrame {
    pub payload: Bytes,
    pub vad_state: Option<VadState>,
    pub vad_offset_ms: Option<i64>,
}

/// Archiver counters, readable at any time.
#[derive(Debug, Clone, Default)]
pub struct ArchiveStats {
    pub total_chunks: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub memory_usage_mb: f64,
    pub last_upload_at: Option<String>,
}

/// Why an upload ran; logged with the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadReason {
    Scheduled,
    Emergency,
    Final,
}

impl UploadReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Emergency => "emergency",
            Self::Final => "final",
        }
    }
}

struct WindowEntry {
    /// Monotonic arrival time, used for eviction.
    at: Instant,
    /// Wall-clock arrival time, used for chunk metadata.
    wall_ms: u64,
    payload: Bytes,
}

struct ArchiverInner {
    session_id: String,
    config: ArchiveConfig,
    store: Arc<dyn ObjectStore>,
    window: Mutex<VecDeque<WindowEntry>>,
    /// Frames of the VAD span currently open (only with `store_vad_segments`).
    vad_segment: Mutex<Option<Vec<Bytes>>>,
    vad_segment_index: AtomicU64,
    stats: Mutex<ArchiveStats>,
    /// Prevents concurrent uploads; snapshotting under `window`'s lock keeps
    /// each upload internally consistent.
    uploading: AtomicBool,
    active: AtomicBool,
    cancel: CancellationToken,
}

/// Sliding-window archiver owned by one session.
pub struct SessionArchiver {
    inner: Arc<ArchiverInner>,
}

impl SessionArchiver {
    /// Creates the archiver and starts its upload and cleanup tickers.
    ///
    /// A rejected configuration is the one construction failure; callers log
    /// it and run the session without archival.
    pub fn new(
        session_id: impl Into<String>,
        config: ArchiveConfig,
        store: Arc<dyn ObjectStore>,
    ) -> GatewayResult<Self> {
        config
            .validate()
            .map_err(GatewayError::Configuration)?;

        let inner = Arc::new(ArchiverInner {
            session_id: session_id.into(),
            config,
            store,
            window: Mutex::new(VecDeque::new()),
            vad_segment: Mutex::new(None),
            vad_segment_index: AtomicU64::new(0),
            stats: Mutex::new(ArchiveStats::default()),
            uploading: AtomicBool::new(false),
            active: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });

        Self::spawn_upload_ticker(Arc::clone(&inner));
        Self::spawn_cleanup_ticker(Arc::clone(&inner));

        log::info!(
            "[Archive] Started for session {} (window={}ms, interval={}ms)",
            inner.session_id,
            inner.config.window_size_ms,
            inner.config.upload_interval_ms
        );

        Ok(Self { inner })
    }

    fn spawn_upload_ticker(inner: Arc<ArchiverInner>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(inner.config.upload_interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // the zeroth tick completes immediately
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if inner.active.load(Ordering::SeqCst) && !inner.window.lock().is_empty() {
                            inner.upload_window(UploadReason::Scheduled).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_cleanup_ticker(inner: Arc<ArchiverInner>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(ARCHIVE_CLEANUP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.evict_and_measure();
                    }
                }
            }
        });
    }

    /// Accepts one frame from the session worker.
    ///
    /// Cheap and non-blocking apart from short mutex sections; an
    /// over-budget window hands off to a spawned emergency upload.
    pub fn process(&self, frame: ArchiveFrame) {
        let inner = &self.inner;
        if !inner.active.load(Ordering::SeqCst) {
            return;
        }

        if inner.config.store_original_audio && !frame.payload.is_empty() {
            let mut window = inner.window.lock();
            window.push_back(WindowEntry {
                at: Instant::now(),
                wall_ms: now_millis(),
                payload: frame.payload.clone(),
            });
            inner.stats.lock().total_chunks += 1;
        }

        if inner.config.store_vad_segments {
            inner.track_vad_segment(&frame);
        }

        let memory_mb = inner.evict_and_measure();
        if memory_mb > inner.config.max_memory_mb {
            log::warn!(
                "[Archive] Session {} window at {:.2}MB (budget {:.2}MB), emergency upload",
                inner.session_id,
                memory_mb,
                inner.config.max_memory_mb
            );
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                inner.upload_window(UploadReason::Emergency).await;
            });
        }
    }

    /// Snapshot of the archiver counters.
    #[must_use]
    pub fn stats(&self) -> ArchiveStats {
        self.inner.stats.lock().clone()
    }

    /// Stops the tickers and flushes whatever the window still holds.
    ///
    /// The final upload is bounded; a hung store cannot keep the session's
    /// teardown from completing.
    pub async fn shutdown(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            self.inner.cancel.cancel();
            let pending = !self.inner.window.lock().is_empty();
            if pending && !self.inner.uploading.load(Ordering::SeqCst) {
                let flush = self.inner.upload_window(UploadReason::Final);
                if tokio::time::timeout(
                    Duration::from_secs(ARCHIVE_FINAL_UPLOAD_TIMEOUT_SECS),
                    flush,
                )
                .await
                .is_err()
                {
                    log::warn!(
                        "[Archive] Session {} final upload timed out",
                        self.inner.session_id
                    );
                }
            }
            self.inner.window.lock().clear();
            let stats = self.stats();
            log::info!(
                "[Archive] Session {} stopped: {} frames seen, {} uploads ok, {} failed",
                self.inner.session_id,
                stats.total_chunks,
                stats.uploads_completed,
                stats.uploads_failed
            );
        }
    }
}

impl ArchiverInner {
    /// Evicts entries older than the window span and refreshes the memory gauge.
    fn evict_and_measure(&self) -> f64 {
        let mut window = self.window.lock();
        let cutoff = Instant::now().checked_sub(Duration::from_millis(self.config.window_size_ms));
        if let Some(cutoff) = cutoff {
            while window.front().is_some_and(|e| e.at <= cutoff) {
                window.pop_front();
            }
        }
        let bytes: usize = window.iter().map(|e| e.payload.len()).sum();
        drop(window);

        let memory_mb = bytes as f64 / (1024.0 * 1024.0);
        self.stats.lock().memory_usage_mb = memory_mb;
        memory_mb
    }

    /// Uploads a snapshot of the live window as one WAV chunk.
    ///
    /// The window is NOT cleared on success: time-based eviction keeps it
    /// sliding, and adjacent chunks deliberately overlap by up to
    /// `window_size_ms − upload_interval_ms` so a failed upload never loses
    /// audio that a neighbor still covers.
    async fn upload_window(&self, reason: UploadReason) {
        if self
            .uploading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let (segments, first_ms, last_ms) = {
            let window = self.window.lock();
            match (window.front(), window.back()) {
                (Some(first), Some(last)) => (
                    window.iter().map(|e| e.payload.clone()).collect::<Vec<_>>(),
                    first.wall_ms,
                    last.wall_ms,
                ),
                _ => {
                    self.uploading.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };

        let chunk_index = now_millis() / self.config.upload_interval_ms;
        let key = format!(
            "{ARCHIVE_KEY_PREFIX}session_{}_original_{}.wav",
            self.session_id, chunk_index
        );
        let wav = assemble_wav(&segments);
        let duration_seconds =
            (last_ms.saturating_sub(first_ms) + FRAME_DURATION_MS) as f64 / 1000.0;
        let metadata = ArchiveMetadata {
            session_id: self.session_id.clone(),
            audio_type: "original".to_string(),
            chunk_index,
            chunk_count: self.stats.lock().uploads_completed + 1,
            start_timestamp: iso_from_millis(first_ms),
            end_timestamp: iso_from_millis(last_ms),
            duration_seconds,
            uploaded_at: iso_timestamp(),
        };

        match self.store.put(&key, wav, AUDIO_WAV, &metadata).await {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.uploads_completed += 1;
                stats.last_upload_at = Some(metadata.uploaded_at.clone());
                drop(stats);
                log::info!(
                    "[Archive] {} upload ok: {} ({} segments, {:.1}s)",
                    reason.as_str(),
                    key,
                    segments.len(),
                    duration_seconds
                );
            }
            Err(e) => {
                self.stats.lock().uploads_failed += 1;
                // No retry loop: the next tick covers a superset of this span.
                log::warn!("[Archive] {} upload failed: {}: {}", reason.as_str(), key, e);
            }
        }

        if reason == UploadReason::Emergency {
            {
                let mut window = self.window.lock();
                let keep = window.len().div_ceil(2);
                while window.len() > keep {
                    window.pop_front();
                }
            }
            self.evict_and_measure();
        }

        self.uploading.store(false, Ordering::SeqCst);
    }

    /// Accumulates VAD-bounded spans and flushes each on its end boundary.
    fn track_vad_segment(&self, frame: &ArchiveFrame) {
        let mut segment = self.vad_segment.lock();
        match frame.vad_state {
            Some(VadState::Start) => {
                let mut frames = Vec::new();
                if !frame.payload.is_empty() {
                    frames.push(frame.payload.clone());
                }
                *segment = Some(frames);
            }
            Some(VadState::End) => {
                let Some(mut frames) = segment.take() else {
                    return;
                };
                if !frame.payload.is_empty() {
                    // A positive end offset trims the boundary chunk to the
                    // portion inside the utterance, as the ASR path does.
                    let tail = match frame.vad_offset_ms {
                        Some(off) if off > 0 => frame
                            .payload
                            .slice(..crate::audio::offset_bytes(off).min(frame.payload.len())),
                        _ => frame.payload.clone(),
                    };
                    frames.push(tail);
                }
                if frames.is_empty() {
                    return;
                }
                let index = self.vad_segment_index.fetch_add(1, Ordering::Relaxed);
                let key = format!(
                    "{ARCHIVE_KEY_PREFIX}session_{}_vad_{}.wav",
                    self.session_id, index
                );
                let wav = assemble_wav(&frames);
                let now = now_millis();
                let metadata = ArchiveMetadata {
                    session_id: self.session_id.clone(),
                    audio_type: "vad".to_string(),
                    chunk_index: index,
                    chunk_count: index + 1,
                    start_timestamp: iso_from_millis(now),
                    end_timestamp: iso_from_millis(now),
                    duration_seconds: (wav.len().saturating_sub(44)) as f64 / 32_000.0,
                    uploaded_at: iso_timestamp(),
                };
                let store = Arc::clone(&self.store);
                let session_id = self.session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.put(&key, wav, AUDIO_WAV, &metadata).await {
                        log::warn!("[Archive] VAD segment upload failed for {}: {}", session_id, e);
                    }
                });
            }
            _ => {
                if let Some(frames) = segment.as_mut() {
                    if !frame.payload.is_empty() {
                        frames.push(frame.payload.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    fn test_frame(len: usize) -> ArchiveFrame {
        ArchiveFrame {
            payload: Bytes::from(vec![0u8; len]),
            vad_state: None,
            vad_offset_ms: None,
        }
    }

    fn test_config() -> ArchiveConfig {
        ArchiveConfig {
            window_size_ms: 2_000,
            upload_interval_ms: 1_000,
            max_memory_mb: 10.0,
            store_original_audio: true,
            store_vad_segments: false,
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let config = ArchiveConfig {
            window_size_ms: 0,
            ..ArchiveConfig::default()
        };
        assert!(SessionArchiver::new("s", config, store).is_err());
    }

    /// Lets freshly spawned ticker tasks register their timers.
    ///
    /// With `start_paused = true`, a timer only responds to `time::advance`
    /// after its task has been polled once.
    async fn settle_tasks() {
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_upload_fires_without_clearing_window() {
        let store = Arc::new(MemoryObjectStore::new());
        let archiver =
            SessionArchiver::new("abc", test_config(), store.clone() as Arc<dyn ObjectStore>)
                .unwrap();
        settle_tasks().await;

        for _ in 0..4 {
            archiver.process(test_frame(4096));
        }

        tokio::time::advance(Duration::from_millis(1_050)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.len(), 1);
        let infos = store.list(ARCHIVE_KEY_PREFIX).await.unwrap();
        assert!(infos[0].key.starts_with("audio-sessions/session_abc_original_"));
        assert!(infos[0].key.ends_with(".wav"));
        assert_eq!(infos[0].metadata.audio_type, "original");

        // Window survives the upload; the next tick re-covers it
        let stats = archiver.stats();
        assert_eq!(stats.uploads_completed, 1);
        assert!(stats.memory_usage_mb > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_evicts_entries_older_than_span() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let config = ArchiveConfig {
            window_size_ms: 1_000,
            upload_interval_ms: 1_000,
            ..test_config()
        };
        let archiver = SessionArchiver::new("abc", config, store).unwrap();

        archiver.process(test_frame(4096));
        tokio::time::advance(Duration::from_millis(1_500)).await;
        archiver.process(test_frame(4096));

        // Only the fresh frame remains: 4096 B ≈ 0.0039 MB
        let stats = archiver.stats();
        assert!(stats.memory_usage_mb < 0.005, "old entry evicted");
        assert_eq!(stats.total_chunks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_upload_halves_the_window() {
        let store = Arc::new(MemoryObjectStore::new());
        let config = ArchiveConfig {
            window_size_ms: 60_000,
            upload_interval_ms: 30_000,
            max_memory_mb: 0.01, // ~10 KB budget
            ..test_config()
        };
        let archiver =
            SessionArchiver::new("abc", config, store.clone() as Arc<dyn ObjectStore>).unwrap();

        for _ in 0..4 {
            archiver.process(test_frame(4096));
        }
        // Let the spawned emergency upload(s) run; repeated triggers before
        // the first lands all write the same chunk key.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(store.len(), 1);
        let stats = archiver.stats();
        assert!(stats.uploads_completed >= 1);
        assert!(
            stats.memory_usage_mb <= 0.01,
            "window shrank below budget after the emergency pass"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_only_bumps_counter() {
        struct FailingStore;
        #[async_trait::async_trait]
        impl ObjectStore for FailingStore {
            async fn put(
                &self,
                _: &str,
                _: Bytes,
                _: &str,
                _: &ArchiveMetadata,
            ) -> GatewayResult<()> {
                Err(GatewayError::Storage("disk full".into()))
            }
            async fn get(&self, _: &str) -> GatewayResult<Option<crate::store::StoredObject>> {
                Ok(None)
            }
            async fn head(&self, _: &str) -> GatewayResult<Option<crate::store::ObjectInfo>> {
                Ok(None)
            }
            async fn list(&self, _: &str) -> GatewayResult<Vec<crate::store::ObjectInfo>> {
                Ok(vec![])
            }
            async fn delete(&self, _: &str) -> GatewayResult<bool> {
                Ok(false)
            }
        }

        let archiver =
            SessionArchiver::new("abc", test_config(), Arc::new(FailingStore)).unwrap();
        settle_tasks().await;
        archiver.process(test_frame(4096));

        tokio::time::advance(Duration::from_millis(1_050)).await;
        tokio::task::yield_now().await;

        let stats = archiver.stats();
        assert_eq!(stats.uploads_completed, 0);
        assert_eq!(stats.uploads_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_deactivates() {
        let store = Arc::new(MemoryObjectStore::new());
        let archiver =
            SessionArchiver::new("abc", test_config(), store.clone() as Arc<dyn ObjectStore>)
                .unwrap();

        archiver.process(test_frame(4096));
        archiver.shutdown().await;

        assert_eq!(store.len(), 1, "final flush ran");
        assert_eq!(archiver.stats().uploads_completed, 1);

        // Frames after shutdown are dropped
        archiver.process(test_frame(4096));
        assert_eq!(archiver.stats().total_chunks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_with_empty_window_uploads_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        let archiver =
            SessionArchiver::new("abc", test_config(), store.clone() as Arc<dyn ObjectStore>)
                .unwrap();
        archiver.shutdown().await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn vad_segments_upload_on_end_when_enabled() {
        let store = Arc::new(MemoryObjectStore::new());
        let config = ArchiveConfig {
            store_vad_segments: true,
            ..test_config()
        };
        let archiver =
            SessionArchiver::new("abc", config, store.clone() as Arc<dyn ObjectStore>).unwrap();

        let vad = |state| ArchiveFrame {
            payload: Bytes::from(vec![0u8; 1024]),
            vad_state: Some(state),
            vad_offset_ms: None,
        };
        archiver.process(vad(VadState::Start));
        archiver.process(test_frame(1024));
        archiver.process(vad(VadState::End));
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let infos = store.list("audio-sessions/session_abc_vad_").await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].metadata.audio_type, "vad");
        // start + middle + end frames
        assert_eq!(infos[0].size, 44 + 3 * 1024);
    }
}
