//! Configuration system for pedia.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEDIA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pedia/config.toml
//!   3. ~/.config/pedia/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::MAX_CHUNK_PAYLOAD;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PediaConfig {
    pub identity: IdentityConfig,
    pub signaling: SignalingConfig,
    pub link: LinkConfig,
    pub distribution: DistributionConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable peer id. Empty = random per run.
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay the node registers with.
    pub relay_addr: String,
    /// Address `pediad relay` binds when none is given on the command line.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// IP the TCP transport binds and advertises in offers.
    pub transport_ip: String,
    pub negotiation_timeout_secs: u64,
    /// Delay before reconnecting after an unexpected link failure.
    pub reconnect_backoff_secs: u64,
    /// Consecutive failed reconnects before a peer is considered gone.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Base chunk size in bytes.
    pub chunk_size: usize,
    /// Adjust chunk size by file category and size.
    pub adaptive_chunking: bool,
    /// Fill level K of the per-transfer fetch loop.
    pub max_concurrent_fetches: usize,
    /// Attempts per chunk before the transfer fails.
    pub max_chunk_attempts: u32,
    pub chunk_timeout_secs: u64,
    /// Rank holders by observed throughput/reliability/latency.
    pub peer_scoring: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub chunk_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Local HTTP control port. 0 = disabled.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_addr: "127.0.0.1:8080".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport_ip: "127.0.0.1".to_string(),
            negotiation_timeout_secs: 10,
            reconnect_backoff_secs: 5,
            max_reconnect_attempts: 3,
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            adaptive_chunking: true,
            max_concurrent_fetches: 5,
            max_chunk_attempts: 3,
            chunk_timeout_secs: 10,
            peer_scoring: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_dir: data_dir().join("chunks"),
            manifest_dir: data_dir().join("manifests"),
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pedia")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("pedia")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PediaConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            PediaConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk_size = self.distribution.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_PAYLOAD {
            return Err(ConfigError::Invalid {
                field: "distribution.chunk_size",
                reason: format!("{chunk_size} is outside 1..={MAX_CHUNK_PAYLOAD}"),
            });
        }
        Ok(())
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEDIA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PediaConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PEDIA_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PEDIA_IDENTITY__PEER_ID") {
            self.identity.peer_id = v;
        }
        if let Some(v) = var("PEDIA_SIGNALING__RELAY_ADDR") {
            self.signaling.relay_addr = v;
        }
        if let Some(v) = var("PEDIA_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
        if let Some(v) = var("PEDIA_DISTRIBUTION__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.distribution.chunk_size = n;
            }
        }
        if let Some(v) = var("PEDIA_DISTRIBUTION__ADAPTIVE_CHUNKING") {
            self.distribution.adaptive_chunking = v == "true" || v == "1";
        }
        if let Some(v) = var("PEDIA_DISTRIBUTION__PEER_SCORING") {
            self.distribution.peer_scoring = v == "true" || v == "1";
        }
        if let Some(v) = var("PEDIA_STORAGE__CHUNK_DIR") {
            self.storage.chunk_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PEDIA_STORAGE__MANIFEST_DIR") {
            self.storage.manifest_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PEDIA_STORAGE__DOWNLOAD_DIR") {
            self.storage.download_dir = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PediaConfig::default();
        assert_eq!(config.distribution.chunk_size, 64 * 1024);
        assert_eq!(config.distribution.max_concurrent_fetches, 5);
        assert_eq!(config.distribution.max_chunk_attempts, 3);
        assert_eq!(config.link.max_reconnect_attempts, 3);
        assert!(config.identity.peer_id.is_empty());
    }

    #[test]
    fn chunk_size_must_fit_one_frame() {
        let mut config = PediaConfig::default();
        assert!(config.validate().is_ok());

        config.distribution.chunk_size = MAX_CHUNK_PAYLOAD;
        assert!(config.validate().is_ok());

        config.distribution.chunk_size = 2 * 1024 * 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "distribution.chunk_size", .. })
        ));

        config.distribution.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply_without_touching_process_env() {
        let mut config = PediaConfig::default();
        config.apply_overrides(|key| match key {
            "PEDIA_IDENTITY__PEER_ID" => Some("node-a".into()),
            "PEDIA_DISTRIBUTION__ADAPTIVE_CHUNKING" => Some("false".into()),
            "PEDIA_API__PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.identity.peer_id, "node-a");
        assert!(!config.distribution.adaptive_chunking);
        assert_eq!(config.api.port, 9090);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("pedia-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[distribution]\nchunk_size = 32768\n").unwrap();

        let config = PediaConfig::from_file(&path).unwrap();
        assert_eq!(config.distribution.chunk_size, 32768);
        assert_eq!(config.distribution.max_chunk_attempts, 3);
        assert_eq!(config.link.negotiation_timeout_secs, 10);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_config_serializes_to_toml() {
        let text = toml::to_string_pretty(&PediaConfig::default()).unwrap();
        let back: PediaConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.distribution.chunk_size, 64 * 1024);
    }
}
