//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! Secrets (API keys, the JWT verification key) come only from the
//! environment; the file carries tuning and network settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use murmur_core::ArchiveConfig;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to (0 = auto-allocate).
    /// Override: `MURMUR_BIND_PORT`
    pub bind_port: u16,

    /// Extra origins allowed to open WebSocket connections, merged with
    /// `CLERK_AUTHORIZED_PARTIES` and localhost.
    pub allowed_origins: Vec<String>,

    /// Audio archival tuning.
    pub archive: ArchiveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 8750,
            allowed_origins: Vec::new(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MURMUR_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
    }

    /// Merges this file/flag configuration with the environment-derived core config.
    pub fn to_core_config(&self) -> murmur_core::Config {
        let mut config = murmur_core::Config::from_env();
        config.preferred_port = self.bind_port;
        config.archive = self.archive.clone();
        config
            .auth
            .authorized_parties
            .extend(self.allowed_origins.iter().cloned());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_port, 8750);
        assert!(config.allowed_origins.is_empty());
        assert!(config.archive.validate().is_ok());
    }

    #[test]
    fn loads_yaml_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind_port: 9000\nallowed_origins:\n  - https://app.example.com\narchive:\n  upload_interval_ms: 30000\n  window_size_ms: 60000"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.allowed_origins, vec!["https://app.example.com"]);
        assert_eq!(config.archive.upload_interval_ms, 30_000);
        // Unspecified fields keep their defaults
        assert!(config.archive.store_original_audio);
    }

    #[test]
    fn core_config_carries_origins_and_archive() {
        let config = ServerConfig {
            bind_port: 9000,
            allowed_origins: vec!["https://app.example.com".into()],
            archive: ArchiveConfig::default(),
        };
        let core = config.to_core_config();
        assert_eq!(core.preferred_port, 9000);
        assert!(core
            .auth
            .authorized_parties
            .contains(&"https://app.example.com".to_string()));
    }
}
