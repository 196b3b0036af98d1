//! Actor infrastructure for stream lifecycles.
//!
//! # Architecture
//!
//! - `StreamWorker`: single consumer of one stream's mailbox, owns its state machine
//! - `WorkerHandle`: bounded, non-blocking sender into a worker's mailbox
//! - `StreamTelemetry`: live metrics and detections shared with readers
//! - `StreamRegistry`: id → worker table, capacity ceiling and shutdown

mod handle;
mod media;
mod messages;
mod registry;
mod telemetry;
mod worker;

pub use handle::{SendError, WorkerHandle};
pub use messages::{StreamMessage, WorkerExit, WorkerOutcome};
pub use registry::{ShutdownReport, StreamRegistry};
pub use telemetry::StreamTelemetry;
pub use worker::WorkerSettings;
