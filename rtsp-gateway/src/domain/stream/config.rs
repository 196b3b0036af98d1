//! Stream configuration descriptor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StreamError;

/// Source URL schemes the pipeline engine can ingest.
pub const SUPPORTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file"];

/// Immutable-per-command description of one stream.
///
/// A worker keeps its own copy for the duration of one lifecycle; a new
/// configuration is only ever applied through a full teardown and restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub stream_id: String,
    #[serde(default)]
    pub rtsp_url: String,
    /// Cloud video stream the fragments are uploaded to.
    #[serde(default)]
    pub kvs_stream_name: String,
    /// Real-time signaling channel.
    #[serde(default)]
    pub webrtc_channel_name: String,

    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames.
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,

    #[serde(default)]
    pub cv_enabled: bool,
    #[serde(default = "default_cv_model")]
    pub cv_model: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Class names to keep; empty keeps everything.
    #[serde(default)]
    pub classes_filter: Vec<String>,

    #[serde(default = "default_true")]
    pub kvs_enabled: bool,
    #[serde(default)]
    pub webrtc_enabled: bool,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_resolution() -> String {
    "1920x1080".to_string()
}

fn default_framerate() -> u32 {
    30
}

fn default_bitrate_kbps() -> u32 {
    2048
}

fn default_gop_size() -> u32 {
    30
}

fn default_cv_model() -> String {
    "yolov5s".to_string()
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

impl StreamConfig {
    /// Configuration with defaults for everything but the id and source.
    pub fn new(stream_id: impl Into<String>, rtsp_url: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        Self {
            kvs_stream_name: stream_id.clone(),
            stream_id,
            rtsp_url: rtsp_url.into(),
            webrtc_channel_name: String::new(),
            resolution: default_resolution(),
            framerate: default_framerate(),
            bitrate_kbps: default_bitrate_kbps(),
            gop_size: default_gop_size(),
            cv_enabled: false,
            cv_model: default_cv_model(),
            confidence_threshold: default_confidence_threshold(),
            classes_filter: Vec::new(),
            kvs_enabled: true,
            webrtc_enabled: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_bitrate(mut self, bitrate_kbps: u32) -> Self {
        self.bitrate_kbps = bitrate_kbps;
        self
    }

    pub fn with_inference(mut self, model: impl Into<String>, threshold: f64) -> Self {
        self.cv_enabled = true;
        self.cv_model = model.into();
        self.confidence_threshold = threshold;
        self
    }

    /// Parse `resolution` into `(width, height)`.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let (w, h) = self.resolution.split_once(['x', 'X'])?;
        let w: u32 = w.trim().parse().ok()?;
        let h: u32 = h.trim().parse().ok()?;
        (w > 0 && h > 0).then_some((w, h))
    }

    /// Check everything that can be checked without talking to a collaborator.
    pub fn validate(&self) -> Result<(), StreamError> {
        let fail = |message: String| Err(StreamError::config(&self.stream_id, message));

        if self.stream_id.trim().is_empty() {
            return fail("stream_id is required".to_string());
        }
        if self.rtsp_url.trim().is_empty() {
            return fail("rtsp_url is required".to_string());
        }
        match Url::parse(&self.rtsp_url) {
            Ok(url) if SUPPORTED_SCHEMES.contains(&url.scheme()) => {}
            Ok(url) => return fail(format!("unsupported source scheme '{}'", url.scheme())),
            Err(e) => return fail(format!("invalid rtsp_url '{}': {e}", self.rtsp_url)),
        }
        if self.dimensions().is_none() {
            return fail(format!(
                "resolution must be WIDTHxHEIGHT, got '{}'",
                self.resolution
            ));
        }
        if self.framerate == 0 {
            return fail("framerate must be positive".to_string());
        }
        if self.bitrate_kbps == 0 {
            return fail("bitrate_kbps must be positive".to_string());
        }
        if self.gop_size == 0 {
            return fail("gop_size must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return fail(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.cv_enabled && self.cv_model.trim().is_empty() {
            return fail("cv_model is required when cv_enabled is set".to_string());
        }
        if self.kvs_enabled && self.kvs_stream_name.trim().is_empty() {
            return fail("kvs_stream_name is required when kvs_enabled is set".to_string());
        }
        if self.webrtc_enabled && self.webrtc_channel_name.trim().is_empty() {
            return fail("webrtc_channel_name is required when webrtc_enabled is set".to_string());
        }
        Ok(())
    }

    /// Sink targets this configuration asks for.
    pub fn sink_targets(&self) -> Vec<&str> {
        let mut targets = Vec::with_capacity(2);
        if self.kvs_enabled {
            targets.push(self.kvs_stream_name.as_str());
        }
        if self.webrtc_enabled {
            targets.push(self.webrtc_channel_name.as_str());
        }
        targets
    }

    /// Whether a detection of `class` is kept by the class filter.
    pub fn accepts_class(&self, class: &str) -> bool {
        self.classes_filter.is_empty() || self.classes_filter.iter().any(|c| c == class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"stream_id":"cam1","rtsp_url":"rtsp://10.0.0.5/live","kvs_stream_name":"cam1"}"#)
                .unwrap();
        assert_eq!(cfg.resolution, "1920x1080");
        assert_eq!(cfg.framerate, 30);
        assert_eq!(cfg.bitrate_kbps, 2048);
        assert_eq!(cfg.gop_size, 30);
        assert_eq!(cfg.cv_model, "yolov5s");
        assert!(cfg.kvs_enabled);
        assert!(!cfg.webrtc_enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_source_url_is_rejected() {
        let cfg = StreamConfig::new("cam1", "");
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "malformed_config");
        assert_eq!(err.stream_id(), "cam1");
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let cfg = StreamConfig::new("cam1", "ftp://camera/stream");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_resolution_is_rejected() {
        let mut cfg = StreamConfig::new("cam1", "rtsp://camera/stream");
        cfg.resolution = "1080p".to_string();
        assert!(cfg.validate().is_err());
        cfg.resolution = "1280x720".to_string();
        assert_eq!(cfg.dimensions(), Some((1280, 720)));
    }

    #[test]
    fn test_enabled_sink_requires_target() {
        let mut cfg = StreamConfig::new("cam1", "rtsp://camera/stream");
        cfg.kvs_stream_name.clear();
        assert!(cfg.validate().is_err());

        cfg.kvs_enabled = false;
        assert!(cfg.validate().is_ok());

        cfg.webrtc_enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_confidence_out_of_range() {
        let cfg = StreamConfig::new("cam1", "rtsp://camera/stream").with_inference("yolov5s", 1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_class_filter() {
        let mut cfg = StreamConfig::new("cam1", "rtsp://camera/stream");
        assert!(cfg.accepts_class("person"));
        cfg.classes_filter = vec!["car".to_string()];
        assert!(!cfg.accepts_class("person"));
        assert!(cfg.accepts_class("car"));
    }
}
