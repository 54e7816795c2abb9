//! Core configuration types.
//!
//! Provides [`Config`] and its sections ([`AuthConfig`], [`AsrConfig`],
//! [`ArchiveConfig`], [`ObjectStoreConfig`]), loaded from process environment
//! variables with per-field validation.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_ARCHIVE_MAX_MEMORY_MB, DEFAULT_ARCHIVE_UPLOAD_INTERVAL_MS, DEFAULT_ARCHIVE_WINDOW_MS,
};

/// Parses the loose boolean strings accepted in environment variables.
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────────────────────────

/// Identity-provider verification settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// RSA public key (PEM) used to verify user bearer tokens.
    /// Unset ⇒ the ticket endpoint refuses all requests.
    /// Env: `CLERK_JWT_KEY`
    pub jwt_public_key: Option<String>,

    /// Origins/parties allowed to present tokens and open WebSocket
    /// connections, in addition to localhost.
    /// Env: `CLERK_AUTHORIZED_PARTIES` (comma-separated)
    pub authorized_parties: Vec<String>,
}

impl AuthConfig {
    fn from_env() -> Self {
        let authorized_parties = env_opt("CLERK_AUTHORIZED_PARTIES")
            .map(|v| {
                v.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            jwt_public_key: env_opt("CLERK_JWT_KEY"),
            authorized_parties,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Speech-to-Text
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream transcription provider settings.
#[derive(Debug, Clone, Default)]
pub struct AsrConfig {
    /// Env: `GROQ_API_KEY`
    pub groq_api_key: Option<String>,

    /// Env: `FIREWORKS_API_KEY`
    pub fireworks_api_key: Option<String>,

    /// Route utterances to Fireworks instead of Groq.
    /// Env: `USE_FIREWORKS`
    pub use_fireworks: bool,

    /// Echo assembled WAVs back to the client before each upstream call.
    /// Env: `DEBUG_MODE`
    pub debug_mode: bool,
}

impl AsrConfig {
    fn from_env() -> Self {
        Self {
            groq_api_key: env_opt("GROQ_API_KEY"),
            fireworks_api_key: env_opt("FIREWORKS_API_KEY"),
            use_fireworks: env_flag("USE_FIREWORKS"),
            debug_mode: env_flag("DEBUG_MODE"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Archival
// ─────────────────────────────────────────────────────────────────────────────

/// Per-session audio archival tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Sliding-window span kept in memory (ms).
    pub window_size_ms: u64,

    /// Interval between scheduled uploads (ms).
    pub upload_interval_ms: u64,

    /// In-memory budget before an emergency upload triggers (MB).
    pub max_memory_mb: f64,

    /// Archive the raw stream regardless of VAD state.
    pub store_original_audio: bool,

    /// Additionally archive each VAD-bounded utterance as its own object.
    pub store_vad_segments: bool,
}

impl ArchiveConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size_ms == 0 {
            return Err("window_size_ms must be >= 1".to_string());
        }
        if self.upload_interval_ms == 0 {
            return Err("upload_interval_ms must be >= 1".to_string());
        }
        if self.upload_interval_ms > self.window_size_ms {
            return Err(
                "upload_interval_ms must not exceed window_size_ms (uploads would leave gaps)"
                    .to_string(),
            );
        }
        if self.max_memory_mb <= 0.0 {
            return Err("max_memory_mb must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            window_size_ms: DEFAULT_ARCHIVE_WINDOW_MS,
            upload_interval_ms: DEFAULT_ARCHIVE_UPLOAD_INTERVAL_MS,
            max_memory_mb: DEFAULT_ARCHIVE_MAX_MEMORY_MB,
            store_original_audio: true,
            store_vad_segments: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object Store
// ─────────────────────────────────────────────────────────────────────────────

/// Blob store connection settings.
///
/// With no endpoint configured the gateway falls back to the in-process
/// store, which is sufficient for tests and single-node evaluation.
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreConfig {
    /// Base URL of the blob gateway. Env: `OBJECT_STORE_ENDPOINT`
    pub endpoint: Option<String>,

    /// Bucket name. Env: `OBJECT_STORE_BUCKET`
    pub bucket: Option<String>,

    /// Bearer token for the blob gateway. Env: `OBJECT_STORE_TOKEN`
    pub token: Option<String>,
}

impl ObjectStoreConfig {
    fn from_env() -> Self {
        Self {
            endpoint: env_opt("OBJECT_STORE_ENDPOINT"),
            bucket: env_opt("OBJECT_STORE_BUCKET"),
            token: env_opt("OBJECT_STORE_TOKEN"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Top-Level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the Murmur gateway.
///
/// All fields have sensible defaults; secrets come from the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Preferred port for the HTTP/WS server (0 = auto-allocate).
    pub preferred_port: u16,

    /// Identity-provider settings.
    pub auth: AuthConfig,

    /// Transcription provider settings.
    pub asr: AsrConfig,

    /// Archival tuning.
    pub archive: ArchiveConfig,

    /// Object-store connection settings.
    pub object_store: ObjectStoreConfig,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            preferred_port: 0,
            auth: AuthConfig::from_env(),
            asr: AsrConfig::from_env(),
            archive: ArchiveConfig::default(),
            object_store: ObjectStoreConfig::from_env(),
        }
    }

    /// Validates the loaded configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.archive.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_config_default_is_valid() {
        assert!(ArchiveConfig::default().validate().is_ok());
    }

    #[test]
    fn archive_config_rejects_zero_window() {
        let config = ArchiveConfig {
            window_size_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn archive_config_rejects_interval_longer_than_window() {
        let config = ArchiveConfig {
            window_size_ms: 10_000,
            upload_interval_ms: 20_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn archive_config_defaults_match_contract() {
        let config = ArchiveConfig::default();
        assert_eq!(config.window_size_ms, 120_000);
        assert_eq!(config.upload_interval_ms, 60_000);
        assert!(config.store_original_audio);
        assert!(!config.store_vad_segments);
    }
}
