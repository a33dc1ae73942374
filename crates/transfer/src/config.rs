//! Transfer engine configuration.
//!
//! Read from a JSON file with camelCase keys; every key is optional and
//! falls back to the protocol defaults.

use std::path::Path;
use std::time::Duration;

use galley_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CHUNKED_DOWNLOAD_THRESHOLD, DEFAULT_CLEANUP_INTERVAL_MS,
    DEFAULT_DOWNLOAD_SESSION_TIMEOUT_MS, DEFAULT_SESSION_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for chunk sizing, thresholds and session expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
    /// Chunk size handed to callers, in bytes.
    pub chunk_size: usize,
    /// Idle time after which an upload session is evicted.
    pub session_timeout_ms: u64,
    /// Idle time after which a download session is evicted.
    pub download_session_timeout_ms: u64,
    /// Objects strictly larger than this are transferred in chunks.
    pub chunked_download_threshold_bytes: u64,
    /// Period of the cleanup sweep.
    pub cleanup_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            download_session_timeout_ms: DEFAULT_DOWNLOAD_SESSION_TIMEOUT_MS,
            chunked_download_threshold_bytes: DEFAULT_CHUNKED_DOWNLOAD_THRESHOLD,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

impl TransferConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no transfer config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        tracing::debug!(path = %path.display(), "transfer config loaded");
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunkSize must be positive".into()));
        }
        if self.session_timeout_ms == 0 || self.download_session_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session timeouts must be positive".into(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cleanupIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn download_session_timeout(&self) -> Duration {
        Duration::from_millis(self.download_session_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = TransferConfig::default();
        assert_eq!(c.chunk_size, 1024 * 1024);
        assert_eq!(c.session_timeout(), Duration::from_secs(3600));
        assert_eq!(c.download_session_timeout(), Duration::from_secs(1800));
        assert_eq!(c.chunked_download_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(c.cleanup_interval(), Duration::from_secs(300));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = TransferConfig::from_json_str(r#"{"chunkSize": 100}"#).unwrap();
        assert_eq!(c.chunk_size, 100);
        assert_eq!(c.session_timeout_ms, DEFAULT_SESSION_TIMEOUT_MS);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = TransferConfig::from_json_str(r#"{"chunkSize": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_cleanup_interval_rejected() {
        let err = TransferConfig::from_json_str(r#"{"cleanupIntervalMs": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = TransferConfig::from_json_str("{chunkSize").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = TransferConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(c, TransferConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.json");
        std::fs::write(
            &path,
            r#"{"chunkedDownloadThresholdBytes": 2048, "sessionTimeoutMs": 1000}"#,
        )
        .unwrap();
        let c = TransferConfig::load(&path).unwrap();
        assert_eq!(c.chunked_download_threshold_bytes, 2048);
        assert_eq!(c.session_timeout(), Duration::from_secs(1));
    }
}
