//! Configuration for the sync engine and its backend.
//!
//! Every section has defaults, so a partial JSON file (or none at all) is valid. Environment
//! variables prefixed with `MULTISTREAM_` override file values.

use crate::sync::RetryPolicy;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the local store and the persisted queues.
    pub data_dir: PathBuf,
    pub backend: BackendConfig,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backend: BackendConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!("Loaded configuration from {:?}", path);
                serde_json::from_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MULTISTREAM_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MULTISTREAM_REST_URL") {
            self.backend.rest_url = value;
        }
        if let Some(value) = lookup("MULTISTREAM_REALTIME_URL") {
            self.backend.realtime_url = value;
        }
        if let Some(value) = lookup("MULTISTREAM_API_KEY") {
            self.backend.api_key = value;
        }
        if let Some(value) = lookup("MULTISTREAM_HEALTH_URL") {
            self.backend.health_url = value;
        }
        if let Some(value) = lookup("MULTISTREAM_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("MULTISTREAM_RECONCILE_SECS") {
            self.engine.reconcile_interval_secs =
                value.parse().map_err(|_| ConfigError::InvalidEnv {
                    key: "MULTISTREAM_RECONCILE_SECS",
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup("MULTISTREAM_MAX_RETRIES") {
            self.engine.retry.max_retries = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "MULTISTREAM_MAX_RETRIES",
                value: value.clone(),
            })?;
        }
        Ok(())
    }
}

/// Backend endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the row REST API, e.g. `https://project.example.com/rest/v1`.
    pub rest_url: String,
    /// WebSocket URL of the realtime channel.
    pub realtime_url: String,
    /// Project API key sent with every request.
    pub api_key: String,
    /// URL polled by the connectivity probe.
    pub health_url: String,
    pub request_timeout_secs: u64,
    pub probe_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            rest_url: "http://localhost:54321/rest/v1".to_string(),
            realtime_url: "ws://localhost:54321/realtime/v1/websocket".to_string(),
            api_key: String::new(),
            health_url: "http://localhost:54321/rest/v1/".to_string(),
            request_timeout_secs: 30,
            probe_interval_secs: 15,
        }
    }
}

/// Tuning of one orchestrator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the full reconciliation pass.
    pub reconcile_interval_secs: u64,
    /// Upper bound on time spent in a forced push before falling back to the queue.
    pub force_sync_timeout_ms: u64,
    /// Number of conflict records kept for inspection.
    pub conflict_audit_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 300,
            force_sync_timeout_ms: 5_000,
            conflict_audit_capacity: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn force_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.force_sync_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "engine": { "reconcileIntervalSecs": 1 } }"#).unwrap();
        // Unknown casing is ignored; the default stays in place.
        assert_eq!(config.engine.reconcile_interval_secs, 300);

        let config: AppConfig =
            serde_json::from_str(r#"{ "engine": { "reconcile_interval_secs": 60 } }"#).unwrap();
        assert_eq!(config.engine.reconcile_interval_secs, 60);
        assert_eq!(config.engine.retry.max_retries, RetryPolicy::default().max_retries);
        assert_eq!(config.backend.request_timeout_secs, 30);
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("MULTISTREAM_REST_URL", "https://api.example.com/rest/v1"),
            ("MULTISTREAM_MAX_RETRIES", "3"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend.rest_url, "https://api.example.com/rest/v1");
        assert_eq!(config.engine.retry.max_retries, 3);
    }

    #[test]
    fn invalid_numeric_override_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == "MULTISTREAM_RECONCILE_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
