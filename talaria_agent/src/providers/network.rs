use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use sysinfo::Networks;

use crate::aggregator::MetricProvider;
use crate::types::{InterfaceInfo, NetworkMetrics};

/// Per-interface throughput. `Networks` is kept alive across samples so
/// `received()`/`transmitted()` are deltas since the previous refresh.
pub struct NetworkSampler {
    state: Mutex<(Networks, Instant)>,
}

impl NetworkSampler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((Networks::new_with_refreshed_list(), Instant::now())),
        }
    }
}

impl Default for NetworkSampler {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0")
}

fn per_sec(bytes: u64, secs: f64) -> u64 {
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
}

impl MetricProvider<NetworkMetrics> for NetworkSampler {
    fn sample(&self) -> anyhow::Result<NetworkMetrics> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (nets, last) = &mut *guard;
        nets.refresh(true);
        let now = Instant::now();
        let secs = now.duration_since(*last).as_secs_f64();
        *last = now;

        let mut interfaces: Vec<InterfaceInfo> = nets
            .iter()
            .filter(|(name, _)| !is_loopback(name))
            .map(|(name, data)| InterfaceInfo {
                name: name.to_string(),
                rx_bytes_per_sec: per_sec(data.received(), secs),
                tx_bytes_per_sec: per_sec(data.transmitted(), secs),
                rx_total: data.total_received(),
                tx_total: data.total_transmitted(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(NetworkMetrics {
            rx_bytes_per_sec: interfaces.iter().map(|i| i.rx_bytes_per_sec).sum(),
            tx_bytes_per_sec: interfaces.iter().map(|i| i.tx_bytes_per_sec).sum(),
            interfaces,
        })
    }
}
