//! Stream record: configuration, lifecycle state and status.

mod config;
mod detection;
mod state;
mod status;

pub use config::{SUPPORTED_SCHEMES, StreamConfig};
pub use detection::{BoundingBox, Detection};
pub use state::StreamState;
pub use status::StreamStatus;
