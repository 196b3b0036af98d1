//! Stream lifecycle events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::StreamState;
use crate::error::StreamError;

/// Capacity of the lifecycle event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable lifecycle event, broadcast to any subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChanged {
        stream_id: String,
        from: StreamState,
        to: StreamState,
        at: DateTime<Utc>,
    },
    /// A reacquisition attempt is about to run.
    ReconnectAttempt {
        stream_id: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// An acquisition or transport failure was recorded into the status.
    Failed { stream_id: String, error: StreamError },
    /// The worker left the registry.
    Retired { stream_id: String },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::StateChanged { stream_id, .. }
            | Self::ReconnectAttempt { stream_id, .. }
            | Self::Failed { stream_id, .. }
            | Self::Retired { stream_id } => stream_id,
        }
    }
}
