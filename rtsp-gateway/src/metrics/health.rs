//! Gateway health evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{StreamState, StreamStatus};

/// Coarse health of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Some streams are in ERROR but still inside the grace period.
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Payload of the health topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    pub control_connected: bool,
    /// Streams currently in ERROR, regardless of how long.
    pub streams_in_error: Vec<String>,
    /// Streams in ERROR for longer than the grace period.
    pub streams_stuck: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Healthy means no stream has been in ERROR beyond `grace_period` and the
/// control channel is connected.
pub fn evaluate_health(
    statuses: &[StreamStatus],
    control_connected: bool,
    grace_period: chrono::Duration,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut streams_in_error = Vec::new();
    let mut streams_stuck = Vec::new();

    for status in statuses.iter().filter(|s| s.state == StreamState::Error) {
        streams_in_error.push(status.stream_id.clone());
        if status.time_in_state(now) > grace_period {
            streams_stuck.push(status.stream_id.clone());
        }
    }

    let status = if !control_connected || !streams_stuck.is_empty() {
        HealthStatus::Unhealthy
    } else if !streams_in_error.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        healthy: status != HealthStatus::Unhealthy,
        status,
        control_connected,
        streams_in_error,
        streams_stuck,
        timestamp: now,
    }
}
