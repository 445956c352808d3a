use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use sysinfo::{DiskRefreshKind, Disks};

use crate::aggregator::MetricProvider;
use crate::types::DiskIoMetrics;

/// Aggregate read/write throughput across all disks.
pub struct DiskIoSampler {
    state: Mutex<(Disks, Option<Instant>)>,
}

impl DiskIoSampler {
    pub fn new() -> Self {
        let mut disks = Disks::new();
        disks.refresh_specifics(true, DiskRefreshKind::nothing().with_io_usage());
        Self {
            state: Mutex::new((disks, Some(Instant::now()))),
        }
    }
}

impl Default for DiskIoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricProvider<DiskIoMetrics> for DiskIoSampler {
    fn sample(&self) -> anyhow::Result<DiskIoMetrics> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (disks, last) = &mut *guard;
        disks.refresh_specifics(true, DiskRefreshKind::nothing().with_io_usage());
        let now = Instant::now();
        let secs = last
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        *last = Some(now);

        let mut m = DiskIoMetrics::default();
        let (mut read, mut written) = (0u64, 0u64);
        for d in disks.iter() {
            let u = d.usage();
            read = read.saturating_add(u.read_bytes);
            written = written.saturating_add(u.written_bytes);
            m.total_read_bytes = m.total_read_bytes.saturating_add(u.total_read_bytes);
            m.total_written_bytes = m.total_written_bytes.saturating_add(u.total_written_bytes);
        }
        if secs > 0.0 {
            m.read_bytes_per_sec = (read as f64 / secs) as u64;
            m.write_bytes_per_sec = (written as f64 / secs) as u64;
        }
        Ok(m)
    }
}
