//! Read-only status snapshot of one stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Detection, StreamState};
use crate::error::StreamError;
use crate::metrics::MetricsSnapshot;

/// Status of one stream as owned by its worker and published on the wire.
///
/// Only the worker mutates this; everyone else reads whole-value copies
/// through a watch channel, so a reader never sees a half-written status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub state: StreamState,
    /// When the current lifecycle last entered RUNNING from STOPPED or ERROR.
    pub start_time: Option<DateTime<Utc>>,
    pub state_since: DateTime<Utc>,
    /// Empty unless the last start or reconnect failed.
    #[serde(default)]
    pub error_message: String,
    /// Tagged failure behind `error_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StreamError>,
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
    #[serde(default)]
    pub last_detections: Arc<Vec<Detection>>,
}

impl StreamStatus {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            state: StreamState::Stopped,
            start_time: None,
            state_since: Utc::now(),
            error_message: String::new(),
            last_error: None,
            reconnect_attempts: 0,
            metrics: MetricsSnapshot::default(),
            last_detections: Arc::new(Vec::new()),
        }
    }

    /// Record a failure; `error_message` mirrors its detail verbatim.
    pub fn record_error(&mut self, error: StreamError) {
        self.error_message = error.message();
        self.last_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error_message.clear();
        self.last_error = None;
    }

    /// How long the stream has been in its current state.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.state_since)
    }
}
