//! Host resource sampling.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use super::ResourceUsage;

/// Caches host CPU and memory readings so callers on a fast tick do not
/// refresh sysinfo more often than `min_interval`.
pub struct HostSampler {
    system: Mutex<System>,
    min_interval: Duration,
    last: Mutex<Option<(Instant, ResourceUsage)>>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            )),
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Current host usage. GPU usage is not sampled here.
    pub fn sample(&self) -> ResourceUsage {
        if let Some((at, usage)) = *self.last.lock()
            && at.elapsed() < self.min_interval
        {
            return usage;
        }

        let usage = {
            let mut system = self.system.lock();
            system.refresh_cpu_all();
            system.refresh_memory();
            ResourceUsage {
                cpu_usage_percent: system.global_cpu_usage() as f64,
                gpu_usage_percent: 0.0,
                memory_mb: system.used_memory() as f64 / (1024.0 * 1024.0),
            }
        };
        *self.last.lock() = Some((Instant::now(), usage));
        usage
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}
