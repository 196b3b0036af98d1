//! In-process collaborators for development runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    EngineError, FailureCallback, Fragment, FragmentCallback, Frame, FrameCallback,
    InferenceEngine, MediaSink, PipelineEngine, PipelineHandle,
};
use crate::domain::{BoundingBox, Detection, StreamConfig};
use crate::metrics::ResourceUsage;

#[derive(Default)]
struct SimPipeline {
    stream_id: String,
    cv_enabled: bool,
    on_failure: Option<FailureCallback>,
    on_frame: Option<FrameCallback>,
    on_fragment: Option<FragmentCallback>,
    token: CancellationToken,
}

#[derive(Default)]
struct FailurePlan {
    remaining: u32,
    message: String,
    always: Option<String>,
}

#[derive(Default)]
struct SimInner {
    next_id: AtomicU64,
    acquire_calls: AtomicU64,
    release_calls: AtomicU64,
    failures: Mutex<FailurePlan>,
    acquire_delay: Mutex<Duration>,
    pipelines: Mutex<HashMap<u64, SimPipeline>>,
    acquired_configs: Mutex<Vec<StreamConfig>>,
    generate_media: bool,
}

impl SimInner {
    fn frame_callback(&self, id: u64) -> Option<FrameCallback> {
        self.pipelines.lock().get(&id).and_then(|p| p.on_frame.clone())
    }

    fn fragment_callback(&self, id: u64) -> Option<FragmentCallback> {
        self.pipelines.lock().get(&id).and_then(|p| p.on_fragment.clone())
    }

    fn find(&self, stream_id: &str) -> Option<u64> {
        self.pipelines
            .lock()
            .iter()
            .find(|(_, p)| p.stream_id == stream_id)
            .map(|(id, _)| *id)
    }
}

/// Pipeline engine that hands out fake handles.
///
/// Acquisition can be scripted to fail or stall, failures can be injected on
/// a live handle, and with [`SimulatedPipelineEngine::with_media`] each
/// pipeline emits frames and fragments at its configured framerate.
#[derive(Clone, Default)]
pub struct SimulatedPipelineEngine {
    inner: Arc<SimInner>,
}

impl SimulatedPipelineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose pipelines produce synthetic media.
    pub fn with_media() -> Self {
        Self {
            inner: Arc::new(SimInner {
                generate_media: true,
                ..Default::default()
            }),
        }
    }

    /// Fail the next `count` acquisitions with `message`.
    pub fn fail_next_acquires(&self, count: u32, message: impl Into<String>) {
        let mut plan = self.inner.failures.lock();
        plan.remaining = count;
        plan.message = message.into();
    }

    /// Fail every acquisition until cleared with `None`.
    pub fn fail_all_acquires(&self, message: Option<String>) {
        self.inner.failures.lock().always = message;
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.inner.acquire_delay.lock() = delay;
    }

    pub fn acquire_calls(&self) -> u64 {
        self.inner.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> u64 {
        self.inner.release_calls.load(Ordering::SeqCst)
    }

    pub fn active_handles(&self) -> usize {
        self.inner.pipelines.lock().len()
    }

    pub fn active_for(&self, stream_id: &str) -> usize {
        self.inner
            .pipelines
            .lock()
            .values()
            .filter(|p| p.stream_id == stream_id)
            .count()
    }

    /// Every configuration successfully acquired, in order.
    pub fn acquired_configs(&self) -> Vec<StreamConfig> {
        self.inner.acquired_configs.lock().clone()
    }

    /// Fire the failure callback of the stream's live pipeline.
    pub fn inject_failure(&self, stream_id: &str, reason: impl Into<String>) -> bool {
        let callback = {
            let pipelines = self.inner.pipelines.lock();
            pipelines
                .values()
                .find(|p| p.stream_id == stream_id)
                .and_then(|p| p.on_failure.clone())
        };
        match callback {
            Some(callback) => {
                callback(reason.into());
                true
            }
            None => false,
        }
    }

    pub fn emit_frame(&self, stream_id: &str, frame: Frame) -> bool {
        let callback = self
            .inner
            .find(stream_id)
            .and_then(|id| self.inner.frame_callback(id));
        match callback {
            Some(callback) => {
                callback(frame);
                true
            }
            None => false,
        }
    }

    pub fn emit_fragment(&self, stream_id: &str, fragment: Fragment) -> bool {
        let callback = self
            .inner
            .find(stream_id)
            .and_then(|id| self.inner.fragment_callback(id));
        match callback {
            Some(callback) => {
                callback(fragment);
                true
            }
            None => false,
        }
    }

    fn spawn_media(&self, id: u64, config: &StreamConfig, token: CancellationToken) {
        let inner = self.inner.clone();
        let framerate = config.framerate.max(1);
        let (width, height) = config.dimensions().unwrap_or((1920, 1080));
        let fragment_len = (config.bitrate_kbps as usize * 1000 / 8 / framerate as usize).max(1);
        let gop = config.gop_size.max(1) as u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1) / framerate);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sequence = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let pts_ms = sequence * 1000 / framerate as u64;
                if let Some(on_frame) = inner.frame_callback(id) {
                    on_frame(Frame {
                        sequence,
                        pts_ms,
                        width,
                        height,
                        data: Bytes::from(vec![0u8; 64]),
                    });
                }
                if let Some(on_fragment) = inner.fragment_callback(id) {
                    on_fragment(Fragment {
                        sequence,
                        timestamp_ms: pts_ms,
                        keyframe: sequence % gop == 0,
                        data: Bytes::from(vec![0u8; fragment_len]),
                    });
                }
                sequence += 1;
            }
        });
    }
}

#[async_trait]
impl PipelineEngine for SimulatedPipelineEngine {
    async fn acquire(&self, config: &StreamConfig) -> Result<PipelineHandle, EngineError> {
        self.inner.acquire_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.acquire_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut plan = self.inner.failures.lock();
            if let Some(message) = &plan.always {
                return Err(EngineError::transient(message.clone()));
            }
            if plan.remaining > 0 {
                plan.remaining -= 1;
                return Err(EngineError::transient(plan.message.clone()));
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        self.inner.pipelines.lock().insert(
            id,
            SimPipeline {
                stream_id: config.stream_id.clone(),
                cv_enabled: config.cv_enabled,
                token: token.clone(),
                ..Default::default()
            },
        );
        self.inner.acquired_configs.lock().push(config.clone());
        if self.inner.generate_media {
            self.spawn_media(id, config, token);
        }

        debug!(stream_id = %config.stream_id, pipeline = id, "Simulated pipeline acquired");
        Ok(PipelineHandle::new(id, &config.stream_id))
    }

    async fn release(&self, handle: &PipelineHandle) {
        self.inner.release_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(pipeline) = self.inner.pipelines.lock().remove(&handle.id()) {
            pipeline.token.cancel();
        }
    }

    fn register_failure_callback(&self, handle: &PipelineHandle, callback: FailureCallback) {
        if let Some(p) = self.inner.pipelines.lock().get_mut(&handle.id()) {
            p.on_failure = Some(callback);
        }
    }

    fn submit_frame_callback(&self, handle: &PipelineHandle, callback: FrameCallback) {
        if let Some(p) = self.inner.pipelines.lock().get_mut(&handle.id()) {
            p.on_frame = Some(callback);
        }
    }

    fn register_fragment_callback(&self, handle: &PipelineHandle, callback: FragmentCallback) {
        if let Some(p) = self.inner.pipelines.lock().get_mut(&handle.id()) {
            p.on_fragment = Some(callback);
        }
    }

    fn resource_usage(&self, handle: &PipelineHandle) -> Option<ResourceUsage> {
        let pipelines = self.inner.pipelines.lock();
        let pipeline = pipelines.get(&handle.id())?;
        Some(ResourceUsage {
            cpu_usage_percent: 3.0 + rand::random::<f64>() * 2.0,
            gpu_usage_percent: if pipeline.cv_enabled { 12.0 } else { 0.0 },
            memory_mb: 48.0 + rand::random::<f64>() * 4.0,
        })
    }
}

/// Inference engine that never detects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInferenceEngine;

#[async_trait]
impl InferenceEngine for NoopInferenceEngine {
    async fn infer(&self, _model: &str, _frame: &Frame) -> Result<Vec<Detection>, EngineError> {
        Ok(Vec::new())
    }
}

/// Inference engine returning a fixed detection list after an optional delay.
pub struct SimulatedInferenceEngine {
    detections: Vec<Detection>,
    latency: Duration,
    calls: AtomicU64,
}

impl SimulatedInferenceEngine {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            latency: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// A person and a car in every frame.
    pub fn street_scene() -> Self {
        Self::new(vec![
            Detection::new(
                "person",
                0.91,
                BoundingBox {
                    x: 120.0,
                    y: 80.0,
                    width: 64.0,
                    height: 180.0,
                },
            ),
            Detection::new(
                "car",
                0.42,
                BoundingBox {
                    x: 600.0,
                    y: 400.0,
                    width: 220.0,
                    height: 120.0,
                },
            ),
        ])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for SimulatedInferenceEngine {
    async fn infer(&self, _model: &str, _frame: &Frame) -> Result<Vec<Detection>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.detections.clone())
    }
}

/// Media sink that counts what it receives.
#[derive(Default)]
pub struct CountingSink {
    fragments: AtomicU64,
    bytes: AtomicU64,
    ready: AtomicU64,
    closed: AtomicU64,
    fail_pushes: AtomicBool,
    unknown_targets: Mutex<HashSet<String>>,
    callbacks: Mutex<HashMap<u64, (String, FailureCallback)>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `target` as unknown to [`MediaSink::supports_target`].
    pub fn reject_target(&self, target: impl Into<String>) {
        self.unknown_targets.lock().insert(target.into());
    }

    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    pub fn fragments(&self) -> u64 {
        self.fragments.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn ready_signals(&self) -> u64 {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fire the failure callback registered for the stream.
    pub fn inject_failure(&self, stream_id: &str, reason: impl Into<String>) -> bool {
        let callback = self
            .callbacks
            .lock()
            .values()
            .find(|(id, _)| id == stream_id)
            .map(|(_, cb)| cb.clone());
        match callback {
            Some(callback) => {
                callback(reason.into());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MediaSink for CountingSink {
    fn supports_target(&self, target: &str) -> bool {
        !self.unknown_targets.lock().contains(target)
    }

    async fn push_fragment(&self, _handle: &PipelineHandle, data: Bytes) -> Result<(), EngineError> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(EngineError::transient("sink rejected fragment"));
        }
        self.fragments.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn signal_ready(&self, _handle: &PipelineHandle) -> Result<(), EngineError> {
        self.ready.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_failure_callback(&self, handle: &PipelineHandle, callback: FailureCallback) {
        self.callbacks
            .lock()
            .insert(handle.id(), (handle.stream_id().to_string(), callback));
    }

    async fn close(&self, handle: &PipelineHandle) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().remove(&handle.id());
    }
}
