use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gfxinfo::active_gpu;
use tracing::{debug, info};

use crate::aggregator::MetricProvider;
use crate::cache::CacheCell;
use crate::types::GpuMetrics;

const TTL: Duration = Duration::from_millis(1500);

/// Active GPU load and VRAM. The first failed probe marks the GPU absent and
/// later samples skip probing altogether.
pub struct GpuSampler {
    enabled: bool,
    absent: AtomicBool,
    cache: CacheCell<Option<GpuMetrics>>,
}

impl GpuSampler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            absent: AtomicBool::new(false),
            cache: CacheCell::new(TTL),
        }
    }

    fn probe(&self) -> Option<GpuMetrics> {
        // gfxinfo errors are not Send; flatten them to text right here.
        let gpu = match active_gpu() {
            Ok(gpu) => gpu,
            Err(e) => {
                if !self.absent.swap(true, Ordering::AcqRel) {
                    info!(error = %e, "no usable GPU, disabling GPU sampling");
                }
                return None;
            }
        };
        let info = gpu.info();
        let m = GpuMetrics {
            name: gpu.model().to_string(),
            utilization_pct: (info.load_pct() as u32).min(100),
            mem_used_bytes: info.used_vram(),
            mem_total_bytes: info.total_vram(),
        };
        debug!(gpu = %m.name, load = m.utilization_pct, "gpu sampled");
        Some(m)
    }
}

impl MetricProvider<Option<GpuMetrics>> for GpuSampler {
    fn sample(&self) -> anyhow::Result<Option<GpuMetrics>> {
        if !self.enabled || self.absent.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.cache.get(|| self.probe()))
    }
}
