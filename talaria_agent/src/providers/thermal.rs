use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sysinfo::Components;

use crate::aggregator::MetricProvider;
use crate::cache::CacheCell;
use crate::types::ThermalMetrics;

// Sensor scans are slow on some hosts; don't rescan on every tick.
const TTL: Duration = Duration::from_millis(1500);

pub struct ThermalSampler {
    enabled: bool,
    components: Mutex<Option<Components>>,
    cache: CacheCell<Option<f32>>,
}

impl ThermalSampler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            components: Mutex::new(None),
            cache: CacheCell::new(TTL),
        }
    }

    fn read(&self) -> Option<f32> {
        let mut guard = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        let components = guard.get_or_insert_with(Components::new_with_refreshed_list);
        components.refresh(false);
        components.iter().find_map(|c| {
            let l = c.label().to_ascii_lowercase();
            if l.contains("cpu")
                || l.contains("package")
                || l.contains("tctl")
                || l.contains("tdie")
                || l.contains("soc")
            {
                c.temperature().filter(|t| t.is_finite() && *t > 0.0)
            } else {
                None
            }
        })
    }
}

impl MetricProvider<ThermalMetrics> for ThermalSampler {
    fn sample(&self) -> anyhow::Result<ThermalMetrics> {
        if !self.enabled {
            return Ok(ThermalMetrics::default());
        }
        Ok(ThermalMetrics {
            cpu_temp_c: self.cache.get(|| self.read()),
        })
    }
}
