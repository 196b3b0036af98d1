//! Live counters shared between a worker, its media tasks and readers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::domain::{Detection, StreamStatus};
use crate::metrics::PerformanceMetrics;

#[derive(Debug, Default)]
pub struct StreamTelemetry {
    pub metrics: PerformanceMetrics,
    /// Replaced wholesale on each inference cycle.
    detections: RwLock<Arc<Vec<Detection>>>,
    frames_dropped: AtomicU64,
}

impl StreamTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_detections(&self, detections: Vec<Detection>) {
        *self.detections.write() = Arc::new(detections);
    }

    pub fn clear_detections(&self) {
        *self.detections.write() = Arc::new(Vec::new());
    }

    pub fn detections(&self) -> Arc<Vec<Detection>> {
        self.detections.read().clone()
    }

    /// Count a frame dropped because the inference queue was full.
    pub fn record_dropped_frame(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Fill the live fields of a worker-owned status.
    pub fn compose(&self, base: &StreamStatus) -> StreamStatus {
        let mut status = base.clone();
        status.metrics = self.metrics.snapshot();
        status.last_detections = self.detections();
        status
    }
}
