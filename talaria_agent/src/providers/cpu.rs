use std::sync::{Mutex, PoisonError};

use sysinfo::{CpuRefreshKind, RefreshKind, System};

use crate::aggregator::MetricProvider;
use crate::types::CpuMetrics;

/// Global and per-core CPU usage. The `System` is long-lived so usage is
/// measured between consecutive samples.
pub struct CpuSampler {
    sys: Mutex<System>,
}

impl CpuSampler {
    pub fn new() -> Self {
        let mut sys =
            System::new_with_specifics(RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()));
        // Prime the counters so the first real sample has a baseline.
        sys.refresh_cpu_usage();
        Self {
            sys: Mutex::new(sys),
        }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricProvider<CpuMetrics> for CpuSampler {
    fn sample(&self) -> anyhow::Result<CpuMetrics> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu_usage();
        let per_core: Vec<f32> = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
        Ok(CpuMetrics {
            usage_percent: sys.global_cpu_usage(),
            core_count: per_core.len(),
            model: sys
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            per_core,
        })
    }
}
