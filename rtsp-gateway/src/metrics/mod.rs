//! Metrics and health.
//!
//! - Lock-free per-stream performance counters
//! - Host CPU/memory sampling
//! - Gateway health evaluation

mod health;
mod host;
mod performance;

pub use health::{HealthReport, HealthStatus, evaluate_health};
pub use host::HostSampler;
pub use performance::{MetricsSnapshot, PerformanceMetrics, Rate, RateMeter, ResourceUsage};
