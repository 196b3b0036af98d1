//! External collaborators consumed by the orchestrator.
//!
//! The media pipeline, inference, cloud sink and control transport live
//! behind these traits; the orchestrator only drives their lifecycle.

mod channel;
mod lease;
mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{Detection, StreamConfig};
use crate::metrics::ResourceUsage;

pub use channel::{InboundMessage, LoopbackChannel, StdioChannel};
pub use lease::PipelineLease;
pub use simulated::{
    CountingSink, NoopInferenceEngine, SimulatedInferenceEngine, SimulatedPipelineEngine,
};

/// Error reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub message: String,
    /// Whether retrying the same call may succeed.
    pub transient: bool,
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Opaque handle on one acquired pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    id: u64,
    stream_id: String,
}

impl PipelineHandle {
    pub fn new(id: u64, stream_id: impl Into<String>) -> Self {
        Self {
            id,
            stream_id: stream_id.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

/// A decoded frame handed to inference.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub pts_ms: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// A chunk of encoded media for the sink.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Invoked with a reason when a pipeline or sink fails after start.
pub type FailureCallback = Arc<dyn Fn(String) + Send + Sync>;
/// Invoked per decoded frame while inference is enabled.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;
/// Invoked per encoded fragment.
pub type FragmentCallback = Arc<dyn Fn(Fragment) + Send + Sync>;

/// Builds and runs the capture/decode/encode graph for a stream.
///
/// Callbacks may be invoked from any thread and must not block.
#[async_trait]
pub trait PipelineEngine: Send + Sync + 'static {
    async fn acquire(&self, config: &StreamConfig) -> Result<PipelineHandle, EngineError>;

    /// Tear the pipeline down and drop every callback registered on it.
    async fn release(&self, handle: &PipelineHandle);

    fn register_failure_callback(&self, handle: &PipelineHandle, callback: FailureCallback);

    fn submit_frame_callback(&self, handle: &PipelineHandle, callback: FrameCallback);

    fn register_fragment_callback(&self, handle: &PipelineHandle, callback: FragmentCallback);

    fn resource_usage(&self, _handle: &PipelineHandle) -> Option<ResourceUsage> {
        None
    }
}

/// Turns frames into detections.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    async fn infer(&self, model: &str, frame: &Frame) -> Result<Vec<Detection>, EngineError>;
}

/// Cloud upload and real-time signaling client.
#[async_trait]
pub trait MediaSink: Send + Sync + 'static {
    /// Whether the sink knows the named stream or channel.
    fn supports_target(&self, _target: &str) -> bool {
        true
    }

    async fn push_fragment(&self, handle: &PipelineHandle, data: Bytes) -> Result<(), EngineError>;

    async fn signal_ready(&self, handle: &PipelineHandle) -> Result<(), EngineError>;

    fn register_failure_callback(&self, handle: &PipelineHandle, callback: FailureCallback);

    /// Forget everything held for the handle.
    async fn close(&self, handle: &PipelineHandle);
}

/// Pub/sub transport carrying commands in and status out.
///
/// Reconnecting the transport itself is the implementation's concern.
#[async_trait]
pub trait ControlChannel: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), EngineError>;

    /// Next inbound message, `None` once the inbound side is closed for good.
    async fn next_message(&self) -> Option<InboundMessage>;

    fn is_connected(&self) -> bool;
}

/// The collaborators one orchestrator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub pipeline: Arc<dyn PipelineEngine>,
    pub inference: Arc<dyn InferenceEngine>,
    pub sink: Arc<dyn MediaSink>,
    pub channel: Arc<dyn ControlChannel>,
}
