//! Gateway configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object is a valid configuration. A few environment variables override the
//! file for container deployments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::ReconnectPolicy;
use crate::{Error, Result};

pub const ENV_MAX_STREAMS: &str = "GATEWAY_MAX_STREAMS";
pub const ENV_STATUS_INTERVAL_MS: &str = "GATEWAY_STATUS_INTERVAL_MS";
pub const ENV_LOG_DIR: &str = "GATEWAY_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

fn default_name() -> String {
    "rtsp-kvs-gateway".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log: LogConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            inference: InferenceConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> i64 {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Period of both status publication and health evaluation.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// How long a stream may sit in ERROR before the gateway reports unhealthy.
    #[serde(default = "default_error_grace_period_ms")]
    pub error_grace_period_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_max_concurrent_streams() -> usize {
    16
}

fn default_mailbox_capacity() -> usize {
    32
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_status_interval_ms() -> u64 {
    100
}

fn default_error_grace_period_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            mailbox_capacity: default_mailbox_capacity(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            status_interval_ms: default_status_interval_ms(),
            error_grace_period_ms: default_error_grace_period_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn error_grace_period(&self) -> Duration {
        Duration::from_millis(self.error_grace_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Global switch; per-stream `cv_enabled` only applies when this is on.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Frames skipped between two inferred frames.
    #[serde(default = "default_skip_frames")]
    pub skip_frames: u32,
    #[serde(default = "default_inference_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// Frames buffered for inference; newer frames are dropped when full.
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
}

fn default_true() -> bool {
    true
}

fn default_skip_frames() -> u32 {
    5
}

fn default_inference_timeout_ms() -> u64 {
    1000
}

fn default_max_detections() -> usize {
    32
}

fn default_frame_queue() -> usize {
    8
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_frames: default_skip_frames(),
            timeout_ms: default_inference_timeout_ms(),
            max_detections: default_max_detections(),
            frame_queue: default_frame_queue(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub topics: TopicsConfig,
}

fn default_client_id() -> String {
    "rtsp-kvs-gateway".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            topics: TopicsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_command_topic")]
    pub command: String,
    /// Overall status; per-stream status goes to `<status>/<stream_id>`.
    #[serde(default = "default_status_topic")]
    pub status: String,
    #[serde(default = "default_metrics_topic")]
    pub metrics: String,
    #[serde(default = "default_health_topic")]
    pub health: String,
    #[serde(default = "default_response_topic")]
    pub response: String,
}

fn default_command_topic() -> String {
    "kvs/gateway/command".to_string()
}

fn default_status_topic() -> String {
    "kvs/gateway/status".to_string()
}

fn default_metrics_topic() -> String {
    "kvs/gateway/metrics".to_string()
}

fn default_health_topic() -> String {
    "kvs/gateway/health".to_string()
}

fn default_response_topic() -> String {
    "kvs/gateway/response".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            command: default_command_topic(),
            status: default_status_topic(),
            metrics: default_metrics_topic(),
            health: default_health_topic(),
            response: default_response_topic(),
        }
    }
}

impl TopicsConfig {
    pub fn stream_status(&self, stream_id: &str) -> String {
        format!("{}/{}", self.status, stream_id)
    }
}

impl AppConfig {
    /// Load from `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid config file: {}", e)))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_MAX_STREAMS) {
            self.orchestrator.max_concurrent_streams = value
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{ENV_MAX_STREAMS} must be a number, got '{value}'")))?;
        }
        if let Ok(value) = std::env::var(ENV_STATUS_INTERVAL_MS) {
            self.orchestrator.status_interval_ms = value.trim().parse().map_err(|_| {
                Error::config(format!("{ENV_STATUS_INTERVAL_MS} must be a number, got '{value}'"))
            })?;
        }
        if let Ok(value) = std::env::var(ENV_LOG_DIR)
            && !value.trim().is_empty()
        {
            self.log.dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let orchestrator = &self.orchestrator;
        if orchestrator.max_concurrent_streams == 0 {
            return Err(Error::validation("max_concurrent_streams must be positive"));
        }
        if orchestrator.mailbox_capacity == 0 {
            return Err(Error::validation("mailbox_capacity must be positive"));
        }
        if orchestrator.status_interval_ms == 0 {
            return Err(Error::validation("status_interval_ms must be positive"));
        }
        if orchestrator.acquire_timeout_ms == 0 {
            return Err(Error::validation("acquire_timeout_ms must be positive"));
        }
        orchestrator.reconnect.validate().map_err(Error::validation)?;

        if self.inference.frame_queue == 0 {
            return Err(Error::validation("inference.frame_queue must be positive"));
        }

        let topics = &self.control.topics;
        for (name, topic) in [
            ("command", &topics.command),
            ("status", &topics.status),
            ("metrics", &topics.metrics),
            ("health", &topics.health),
            ("response", &topics.response),
        ] {
            if topic.trim().is_empty() {
                return Err(Error::validation(format!("control topic '{name}' is empty")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.orchestrator.max_concurrent_streams, 16);
        assert_eq!(config.orchestrator.status_interval_ms, 100);
        assert_eq!(config.inference.skip_frames, 5);
        assert_eq!(config.control.topics.command, "kvs/gateway/command");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = AppConfig::from_json(
            r#"{"orchestrator":{"max_concurrent_streams":4,"reconnect":{"max_attempts":3}}}"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_concurrent_streams, 4);
        assert_eq!(config.orchestrator.mailbox_capacity, 32);
        assert_eq!(config.orchestrator.reconnect.max_attempts, 3);
        assert_eq!(config.orchestrator.reconnect.initial_delay_ms, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"name":"edge-01","control":{"topics":{"status":"site/status"}}}"#)
            .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.name, "edge-01");
        assert_eq!(config.control.topics.stream_status("cam1"), "site/status/cam1");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.orchestrator.max_concurrent_streams = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let mut config = AppConfig::default();
        config.control.topics.health = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_reconnect_policy() {
        let mut config = AppConfig::default();
        config.orchestrator.reconnect.backoff_multiplier = 0.1;
        assert!(config.validate().is_err());
    }
}
