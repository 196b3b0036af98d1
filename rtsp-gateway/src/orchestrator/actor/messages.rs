//! Messages exchanged with stream workers.

use tokio::sync::oneshot;

use crate::domain::{StreamConfig, StreamStatus};

/// Commands in a worker's mailbox, applied strictly in order.
#[derive(Debug)]
pub enum StreamMessage {
    /// Start the stream with this configuration.
    Start(StreamConfig),
    /// Tear the stream down.
    Stop,
    /// Restart the stream with a new configuration.
    Configure(StreamConfig),
    /// Reply with the status as of this point in the command order.
    Status(oneshot::Sender<StreamStatus>),
}

impl StreamMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Stop => "stop",
            Self::Configure(_) => "configure",
            Self::Status(_) => "status",
        }
    }
}

/// Notifications from collaborators, tagged with the lease they concern.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    TransportFailure {
        lease_id: u64,
        source: FailureSource,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureSource {
    Pipeline,
    Sink,
}

impl std::fmt::Display for FailureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipeline => f.write_str("pipeline"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

/// How a worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Stopped and removed itself from the registry.
    Retired,
    /// Cancelled through its token.
    Cancelled,
    /// Its mailbox closed because the registry dropped the handle.
    Orphaned,
}

/// Result of a finished worker task.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub stream_id: String,
    pub outcome: WorkerOutcome,
}
