//! Stream lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle states of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// No pipeline is held. Initial and terminal state.
    #[default]
    Stopped,
    /// Pipeline acquisition is in flight.
    Starting,
    /// Pipeline is acquired and media is flowing.
    Running,
    /// Pipeline teardown is in flight.
    Stopping,
    /// Acquisition failed or the reconnect budget ran out.
    Error,
    /// Transport was lost; reacquisition with backoff is pending.
    Reconnecting,
}

impl StreamState {
    pub const ALL: [StreamState; 6] = [
        Self::Stopped,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Error,
        Self::Reconnecting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
            Self::Reconnecting => "RECONNECTING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(Self::Stopped),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "ERROR" => Some(Self::Error),
            "RECONNECTING" => Some(Self::Reconnecting),
            _ => None,
        }
    }

    /// Whether a pipeline lease may be held in this state.
    pub fn holds_pipeline(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// States from which `stop` performs a teardown.
    pub fn is_stoppable(&self) -> bool {
        matches!(self, Self::Running | Self::Error | Self::Reconnecting)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: StreamState) -> bool {
        use StreamState::*;

        match (self, target) {
            (Stopped, Starting) => true,
            (Starting, Running | Error) => true,
            (Running, Reconnecting | Stopping) => true,
            (Reconnecting, Running | Error | Stopping) => true,
            (Error, Stopping | Starting) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
