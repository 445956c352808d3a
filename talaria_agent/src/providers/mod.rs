//! Host-backed metric providers and the wiring that binds them to probes.

pub mod connections;
mod cpu;
mod disk_io;
mod disks;
mod gpu;
mod memory;
mod network;
mod system;
mod thermal;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::aggregator::{Probe, Providers};
use crate::config::Config;
use crate::process::{ProcessTracker, TOP_PROCESSES};
use crate::storage::{host_sources, StorageReconciler};

pub use connections::ConnectionTable;
pub use cpu::CpuSampler;
pub use disk_io::DiskIoSampler;
pub use disks::{is_noisy_mount, DiskList};
pub use gpu::GpuSampler;
pub use memory::{pressure_level, MemorySampler};
pub use network::NetworkSampler;
pub use system::{format_uptime, SystemInfo};
pub use thermal::ThermalSampler;

const CHEAP: Duration = Duration::from_millis(200);
const THERMAL: Duration = Duration::from_millis(500);
const DISK_IO: Duration = Duration::from_millis(500);
const SLOW: Duration = Duration::from_secs(2);
const GPU: Duration = Duration::from_secs(3);

/// The probe set plus the connection table, which `/api/connections` also
/// serves directly.
pub struct HostProviders {
    pub providers: Providers,
    pub connections: Arc<ConnectionTable>,
}

pub fn host(cfg: &Config, runtime: Handle) -> HostProviders {
    let disks = Arc::new(DiskList::new());
    let tracker = Arc::new(ProcessTracker::host());
    let connections = Arc::new(ConnectionTable::new(tracker.clone()));

    let storage = Arc::new(StorageReconciler::new(
        host_sources(&cfg.storage),
        disks.clone(),
        cfg.storage.clone(),
        runtime,
    ));

    let providers = Providers {
        cpu: Probe::new("cpu", CHEAP, CpuSampler::new()),
        memory: Probe::new("memory", CHEAP, MemorySampler::new()),
        disks: Probe::new("disks", CHEAP, {
            let disks = disks.clone();
            move || -> anyhow::Result<_> { Ok(disks.list()) }
        }),
        storage: Probe::new("storage_breakdown", CHEAP, {
            let storage = storage.clone();
            move || -> anyhow::Result<_> { Ok(storage.breakdown()) }
        }),
        disk_io: Probe::new("disk_io", DISK_IO, DiskIoSampler::new()),
        network: Probe::new("network", CHEAP, NetworkSampler::new()),
        processes: Probe::new("processes", SLOW, {
            let tracker = tracker.clone();
            move || -> anyhow::Result<_> { Ok(tracker.list_top(TOP_PROCESSES)) }
        }),
        system: Probe::new("system", CHEAP, SystemInfo::new()),
        thermal: Probe::new("thermal", THERMAL, ThermalSampler::new(cfg.providers.thermal)),
        gpu: Probe::new("gpu", GPU, GpuSampler::new(cfg.providers.gpu)),
        connectivity: Probe::new("connectivity", SLOW, {
            let connections = connections.clone();
            move || -> anyhow::Result<_> { connections.summary() }
        }),
    };

    HostProviders {
        providers,
        connections,
    }
}
