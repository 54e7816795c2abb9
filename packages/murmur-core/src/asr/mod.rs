//! Speech-to-text dispatch.
//!
//! Each captured utterance is assembled into a WAV blob and posted to one of
//! two upstream providers as a multipart form. Submissions run on their own
//! tasks so the session worker never waits on an upstream round-trip;
//! results and failures flow back through the connection's outbound channel
//! and are silently discarded if the socket is gone.

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;

use crate::audio::assemble_wav;
use crate::protocol_constants::AUDIO_WAV;
use crate::session::context::UtteranceSnapshot;
use crate::session::messages::{AsrPerformance, ServerMessage};
use crate::session::OutboundSender;
use crate::state::AsrConfig;
use crate::utils::iso_timestamp;

/// Groq transcription endpoint.
pub const GROQ_ENDPOINT: &str = "https://api.groq.com/openai/v1/audio/transcriptions";

/// Fireworks transcription endpoint.
pub const FIREWORKS_ENDPOINT: &str =
    "https://audio-turbo.us-virginia-1.direct.fireworks.ai/v1/audio/transcriptions";

/// Upstream transcription provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Groq,
    Fireworks,
}

impl Provider {
    /// Returns the provider's transcription endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &'static str {
        match self {
            Self::Groq => GROQ_ENDPOINT,
            Self::Fireworks => FIREWORKS_ENDPOINT,
        }
    }

    /// Returns the Whisper variant the provider serves.
    #[must_use]
    pub const fn model(&self) -> &'static str {
        match self {
            Self::Groq => "whisper-large-v3-turbo",
            Self::Fireworks => "whisper-v3-turbo",
        }
    }

    /// Returns the provider as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::Fireworks => "fireworks",
        }
    }
}

/// A submission handed to the dispatcher by the session worker.
#[derive(Debug)]
pub struct UtteranceJob {
    pub utterance: UtteranceSnapshot,
    pub subject: String,
    pub is_prefetch: bool,
    /// Context hint forwarded as the provider's `prompt` field.
    pub prompt: Option<String>,
}

/// Dispatches utterances to the configured transcription provider.
pub struct AsrDispatcher {
    client: reqwest::Client,
    config: AsrConfig,
}

impl AsrDispatcher {
    /// Creates a dispatcher with a shared HTTP client.
    #[must_use]
    pub fn new(config: AsrConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// The provider selected by process configuration.
    #[must_use]
    pub fn provider(&self) -> Provider {
        if self.config.use_fireworks {
            Provider::Fireworks
        } else {
            Provider::Groq
        }
    }

    fn api_key(&self, provider: Provider) -> Option<String> {
        match provider {
            Provider::Groq => self.config.groq_api_key.clone(),
            Provider::Fireworks => self.config.fireworks_api_key.clone(),
        }
    }

    /// Submits an utterance for transcription without blocking the caller.
    ///
    /// Empty submissions are a no-op. Several submissions for one session may
    /// be in flight at once (a prefetch overlapping its final); result
    /// ordering is not guaranteed, clients correlate on `speechEndTimeMs`
    /// and `is_prefetch`.
    pub fn submit(self: &Arc<Self>, job: UtteranceJob, outbound: OutboundSender) {
        if job.utterance.segments.is_empty() {
            return;
        }
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_job(job, outbound).await;
        });
    }

    async fn run_job(&self, job: UtteranceJob, outbound: OutboundSender) {
        let provider = self.provider();
        let started = Instant::now();

        let wav = assemble_wav(&job.utterance.segments);
        let wav_creation_ms = started.elapsed().as_millis() as u64;

        log::debug!(
            "[ASR] Submitting {} bytes for {} via {} (prefetch={}, span={}..{}ms)",
            wav.len(),
            job.subject,
            provider.as_str(),
            job.is_prefetch,
            job.utterance.speech_start_ms,
            job.utterance.speech_end_ms
        );

        if self.config.debug_mode {
            outbound
                .send(ServerMessage::DebugAudio {
                    audio_data: BASE64.encode(&wav),
                    speech_start_time_ms: job.utterance.speech_start_ms,
                    speech_end_time_ms: job.utterance.speech_end_ms,
                    timestamp: iso_timestamp(),
                })
                .await;
        }

        let Some(api_key) = self.api_key(provider) else {
            log::warn!(
                "[ASR] No API key configured for {}; dropping submission",
                provider.as_str()
            );
            outbound
                .send(ServerMessage::TranscriptionError {
                    error: format!("{} API key not configured", provider.as_str()),
                    details: Value::Null,
                    is_prefetch: job.is_prefetch,
                    timestamp: iso_timestamp(),
                })
                .await;
            return;
        };

        let fetch_started = Instant::now();
        let result = self
            .transcribe(provider, &api_key, wav, job.prompt.as_deref())
            .await;
        let api_fetch_ms = fetch_started.elapsed().as_millis() as u64;

        match result {
            Ok(text) => {
                outbound
                    .send(ServerMessage::TranscriptionResult {
                        text,
                        speech_start_time_ms: job.utterance.speech_start_ms,
                        speech_end_time_ms: job.utterance.speech_end_ms,
                        is_prefetch: job.is_prefetch,
                        timestamp: iso_timestamp(),
                        performance: AsrPerformance {
                            total_processing_ms: started.elapsed().as_millis() as u64,
                            wav_creation_ms,
                            api_fetch_ms,
                            worker_timestamp: iso_timestamp(),
                            provider: provider.as_str(),
                        },
                    })
                    .await;
            }
            Err((error, details)) => {
                log::warn!("[ASR] {} call failed: {}", provider.as_str(), error);
                outbound
                    .send(ServerMessage::TranscriptionError {
                        error,
                        details,
                        is_prefetch: job.is_prefetch,
                        timestamp: iso_timestamp(),
                    })
                    .await;
            }
        }
    }

    /// One upstream round-trip; returns the transcript text.
    async fn transcribe(
        &self,
        provider: Provider,
        api_key: &str,
        wav: Bytes,
        prompt: Option<&str>,
    ) -> Result<String, (String, Value)> {
        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str(AUDIO_WAV)
            .map_err(|e| (format!("failed to build multipart body: {e}"), Value::Null))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", provider.model());
        form = match provider {
            Provider::Groq => form.text("response_format", "verbose_json"),
            Provider::Fireworks => form.text("temperature", "0"),
        };
        if let Some(prompt) = prompt {
            form = form.text("prompt", prompt.to_string());
        }

        let resp = self
            .client
            .post(provider.endpoint())
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| (format!("transcription request failed: {e}"), Value::Null))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err((
                format!("{} returned {}", provider.as_str(), status),
                Value::String(body),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| (format!("failed to parse transcription response: {e}"), Value::Null))?;

        body.get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ("transcription response had no text field".to_string(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OutboundSender;
    use tokio::sync::mpsc;

    fn snapshot(len: usize) -> UtteranceSnapshot {
        UtteranceSnapshot {
            segments: vec![Bytes::from(vec![0u8; len])],
            speech_start_ms: 192,
            speech_end_ms: 928,
        }
    }

    #[test]
    fn provider_selection_follows_config() {
        let groq = AsrDispatcher::new(AsrConfig::default());
        assert_eq!(groq.provider(), Provider::Groq);

        let fireworks = AsrDispatcher::new(AsrConfig {
            use_fireworks: true,
            ..Default::default()
        });
        assert_eq!(fireworks.provider(), Provider::Fireworks);
    }

    #[test]
    fn provider_constants() {
        assert_eq!(Provider::Groq.model(), "whisper-large-v3-turbo");
        assert_eq!(Provider::Fireworks.model(), "whisper-v3-turbo");
        assert!(Provider::Groq.endpoint().contains("api.groq.com"));
        assert!(Provider::Fireworks.endpoint().contains("fireworks.ai"));
    }

    #[tokio::test]
    async fn empty_submission_is_a_no_op() {
        let dispatcher = Arc::new(AsrDispatcher::new(AsrConfig::default()));
        let (tx, mut rx) = mpsc::channel(4);
        dispatcher.submit(
            UtteranceJob {
                utterance: UtteranceSnapshot {
                    segments: vec![],
                    speech_start_ms: 0,
                    speech_end_ms: 0,
                },
                subject: "user_42".into(),
                is_prefetch: false,
                prompt: None,
            },
            OutboundSender::new(tx),
        );
        drop(dispatcher);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_api_key_reports_transcription_error() {
        let dispatcher = Arc::new(AsrDispatcher::new(AsrConfig::default()));
        let (tx, mut rx) = mpsc::channel(4);
        dispatcher.submit(
            UtteranceJob {
                utterance: snapshot(4096),
                subject: "user_42".into(),
                is_prefetch: true,
                prompt: None,
            },
            OutboundSender::new(tx),
        );

        let msg = rx.recv().await.expect("error frame emitted");
        let json: Value = match msg {
            axum::extract::ws::Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(json["type"], "transcription_error");
        assert_eq!(json["is_prefetch"], true);
        assert!(json["error"].as_str().unwrap().contains("API key"));
    }

    #[tokio::test]
    async fn debug_mode_emits_wav_before_erroring() {
        let dispatcher = Arc::new(AsrDispatcher::new(AsrConfig {
            debug_mode: true,
            ..Default::default()
        }));
        let (tx, mut rx) = mpsc::channel(4);
        dispatcher.submit(
            UtteranceJob {
                utterance: snapshot(64),
                subject: "user_42".into(),
                is_prefetch: false,
                prompt: None,
            },
            OutboundSender::new(tx),
        );

        let first = rx.recv().await.expect("debug frame emitted");
        let json: Value = match first {
            axum::extract::ws::Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(json["type"], "debug_audio");
        let wav = BASE64.decode(json["audioData"].as_str().unwrap()).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 64);
        assert_eq!(json["speechStartTimeMs"], 192);
        assert_eq!(json["speechEndTimeMs"], 928);
    }
}
