//! Per-stream performance counters.
//!
//! Every field is an independent atomic with exactly one producer: the owning
//! worker writes the resource fields, the fragment forwarder writes output
//! rate and bitrate, the frame callback writes input rate and the inference
//! task writes latency and object count. A snapshot reads each field on its
//! own, so two fields of the same snapshot may come from different moments.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// `f64` stored as raw bits in an `AtomicU64`.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Lock-free per-stream metrics.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    fps_input: AtomicF64,
    fps_output: AtomicF64,
    bitrate_kbps: AtomicF64,
    cpu_usage_percent: AtomicF64,
    gpu_usage_percent: AtomicF64,
    memory_mb: AtomicF64,
    inference_time_ms: AtomicF64,
    objects_detected: AtomicU64,
    /// Unix millis of the most recent write, 0 if never written.
    last_update_ms: AtomicI64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_fps_input(&self, fps: f64) {
        self.fps_input.store(fps);
        self.touch();
    }

    pub fn set_output(&self, fps: f64, bitrate_kbps: f64) {
        self.fps_output.store(fps);
        self.bitrate_kbps.store(bitrate_kbps);
        self.touch();
    }

    pub fn set_resources(&self, usage: &ResourceUsage) {
        self.cpu_usage_percent.store(usage.cpu_usage_percent);
        self.gpu_usage_percent.store(usage.gpu_usage_percent);
        self.memory_mb.store(usage.memory_mb);
        self.touch();
    }

    pub fn record_inference(&self, latency: Duration, objects: usize) {
        self.inference_time_ms.store(latency.as_secs_f64() * 1000.0);
        self.objects_detected.store(objects as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Zero the rate and resource fields when the pipeline goes away.
    pub fn reset_rates(&self) {
        self.fps_input.store(0.0);
        self.fps_output.store(0.0);
        self.bitrate_kbps.store(0.0);
        self.cpu_usage_percent.store(0.0);
        self.gpu_usage_percent.store(0.0);
        self.memory_mb.store(0.0);
        self.touch();
    }

    /// Point-in-time copy with per-field freshness.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_update_ms = self.last_update_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            fps_input: self.fps_input.load(),
            fps_output: self.fps_output.load(),
            bitrate_kbps: self.bitrate_kbps.load(),
            cpu_usage_percent: self.cpu_usage_percent.load(),
            gpu_usage_percent: self.gpu_usage_percent.load(),
            memory_mb: self.memory_mb.load(),
            inference_time_ms: self.inference_time_ms.load(),
            objects_detected: self.objects_detected.load(Ordering::Relaxed),
            last_update: (last_update_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_update_ms).single())
                .flatten(),
        }
    }
}

/// Copy of [`PerformanceMetrics`] as published on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub fps_input: f64,
    pub fps_output: f64,
    pub bitrate_kbps: f64,
    pub cpu_usage_percent: f64,
    pub gpu_usage_percent: f64,
    pub memory_mb: f64,
    pub inference_time_ms: f64,
    pub objects_detected: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Resource consumption reported by a pipeline or sampled from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_usage_percent: f64,
    pub gpu_usage_percent: f64,
    pub memory_mb: f64,
}

/// Events-per-second and bytes-per-second over a rolling one-second window.
///
/// Single producer: owned by whichever task counts the events.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    window_start: Instant,
    events: u64,
    bytes: u64,
}

/// Rates measured over the last closed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub per_second: f64,
    pub kbps: f64,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            window_start: Instant::now(),
            events: 0,
            bytes: 0,
        }
    }

    /// Count one event; returns the rate when a window closes.
    pub fn record(&mut self, bytes: usize) -> Option<Rate> {
        self.events += 1;
        self.bytes += bytes as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed < self.window {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let rate = Rate {
            per_second: self.events as f64 / secs,
            kbps: (self.bytes as f64 * 8.0 / 1000.0) / secs,
        };
        self.window_start = Instant::now();
        self.events = 0;
        self.bytes = 0;
        Some(rate)
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}
