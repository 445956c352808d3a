use std::sync::{Mutex, PoisonError};

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::aggregator::MetricProvider;
use crate::types::MemoryMetrics;

const MB: u64 = 1024 * 1024;

pub struct MemorySampler {
    sys: Mutex<System>,
}

impl MemorySampler {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            sys: Mutex::new(sys),
        }
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse pressure level from the share of memory still available.
pub fn pressure_level(available: u64, total: u64) -> &'static str {
    if total == 0 {
        return "Normal";
    }
    let free_share = available as f64 / total as f64;
    if free_share < 0.05 {
        "Critical"
    } else if free_share < 0.15 {
        "Warn"
    } else {
        "Normal"
    }
}

impl MetricProvider<MemoryMetrics> for MemorySampler {
    fn sample(&self) -> anyhow::Result<MemoryMetrics> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        let total = sys.total_memory();
        let available = sys.available_memory();
        let used = total.saturating_sub(available);
        let used_percent = if total > 0 {
            (used as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };
        Ok(MemoryMetrics {
            total_mb: total / MB,
            used_mb: used / MB,
            free_mb: sys.free_memory() / MB,
            available_mb: available / MB,
            swap_total_mb: sys.total_swap() / MB,
            swap_used_mb: sys.used_swap() / MB,
            used_percent,
            pressure_level: pressure_level(available, total).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_thresholds() {
        assert_eq!(pressure_level(50, 100), "Normal");
        assert_eq!(pressure_level(10, 100), "Warn");
        assert_eq!(pressure_level(1, 100), "Critical");
        assert_eq!(pressure_level(0, 0), "Normal");
    }
}
