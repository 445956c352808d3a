//! Fan-out/fan-in snapshot assembly.
//!
//! Every metric category is sampled by its own [`Probe`]: the provider runs on
//! the blocking pool under a time budget and anything other than a timely `Ok`
//! collapses to the category's `Default` value. All probes run concurrently,
//! so a snapshot costs as much as the slowest budget, not the sum.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::CacheCell;
use crate::types::{
    ConnectivityMetrics, CpuMetrics, DiskInfo, DiskIoMetrics, GpuMetrics, MemoryMetrics,
    NetworkMetrics, ProcessRow, Snapshot, StorageBreakdown, SystemMetrics, ThermalMetrics,
};

/// HTTP polling bursts inside this window share one aggregation pass.
pub const HTTP_SNAPSHOT_TTL: Duration = Duration::from_millis(500);

/// A source of one metric category. Implementations may block; they are
/// always called from the blocking pool.
pub trait MetricProvider<T>: Send + Sync {
    fn sample(&self) -> anyhow::Result<T>;
}

impl<T, F> MetricProvider<T> for F
where
    F: Fn() -> anyhow::Result<T> + Send + Sync,
{
    fn sample(&self) -> anyhow::Result<T> {
        self()
    }
}

/// A provider bound to its category name and time budget.
pub struct Probe<T> {
    category: &'static str,
    budget: Duration,
    provider: Arc<dyn MetricProvider<T>>,
}

impl<T: Default + Send + 'static> Probe<T> {
    pub fn new(
        category: &'static str,
        budget: Duration,
        provider: impl MetricProvider<T> + 'static,
    ) -> Self {
        Self {
            category,
            budget,
            provider: Arc::new(provider),
        }
    }

    /// A probe that always reports the zero value.
    pub fn zeroed(category: &'static str) -> Self {
        Self::new(category, Duration::from_millis(50), || -> anyhow::Result<T> {
            Ok(T::default())
        })
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    async fn run(&self) -> T {
        let provider = self.provider.clone();
        let task = tokio::task::spawn_blocking(move || provider.sample());
        match timeout(self.budget, task).await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(e))) => {
                warn!(category = self.category, error = %e, "provider failed");
                T::default()
            }
            Ok(Err(join)) => {
                warn!(category = self.category, error = %join, "provider panicked");
                T::default()
            }
            Err(_) => {
                warn!(
                    category = self.category,
                    budget_ms = self.budget.as_millis() as u64,
                    "provider timed out"
                );
                T::default()
            }
        }
    }
}

/// The full provider set, one probe per snapshot category.
pub struct Providers {
    pub cpu: Probe<CpuMetrics>,
    pub memory: Probe<MemoryMetrics>,
    pub disks: Probe<Vec<DiskInfo>>,
    pub storage: Probe<StorageBreakdown>,
    pub disk_io: Probe<DiskIoMetrics>,
    pub network: Probe<NetworkMetrics>,
    pub processes: Probe<Vec<ProcessRow>>,
    pub system: Probe<SystemMetrics>,
    pub thermal: Probe<ThermalMetrics>,
    pub gpu: Probe<Option<GpuMetrics>>,
    pub connectivity: Probe<ConnectivityMetrics>,
}

impl Providers {
    /// Providers that report zero values for every category. Handy for tests
    /// and as a base to override single categories.
    pub fn zeroed() -> Self {
        Self {
            cpu: Probe::zeroed("cpu"),
            memory: Probe::zeroed("memory"),
            disks: Probe::zeroed("disks"),
            storage: Probe::zeroed("storage_breakdown"),
            disk_io: Probe::zeroed("disk_io"),
            network: Probe::zeroed("network"),
            processes: Probe::zeroed("processes"),
            system: Probe::zeroed("system"),
            thermal: Probe::zeroed("thermal"),
            gpu: Probe::zeroed("gpu"),
            connectivity: Probe::zeroed("connectivity"),
        }
    }
}

pub struct Aggregator {
    providers: Providers,
}

impl Aggregator {
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }

    /// Sample every category concurrently and join the results.
    pub async fn collect(&self, viewer_count: usize) -> Snapshot {
        let p = &self.providers;
        let (
            cpu,
            memory,
            disks,
            storage_breakdown,
            disk_io,
            network,
            processes,
            system,
            thermal,
            gpu,
            connectivity,
        ) = tokio::join!(
            p.cpu.run(),
            p.memory.run(),
            p.disks.run(),
            p.storage.run(),
            p.disk_io.run(),
            p.network.run(),
            p.processes.run(),
            p.system.run(),
            p.thermal.run(),
            p.gpu.run(),
            p.connectivity.run(),
        );
        Snapshot {
            cpu,
            memory,
            disks,
            storage_breakdown,
            disk_io,
            network,
            processes,
            system,
            thermal,
            gpu,
            connectivity,
            timestamp: now_millis(),
            client_count: viewer_count,
        }
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Serialized snapshots for on-demand HTTP requests, memoized briefly so a
/// burst of polling dashboards costs one aggregation pass.
pub struct SnapshotCache {
    aggregator: Arc<Aggregator>,
    cell: CacheCell<Option<Arc<str>>>,
}

impl SnapshotCache {
    pub fn new(aggregator: Arc<Aggregator>, ttl: Duration) -> Self {
        Self {
            aggregator,
            cell: CacheCell::new(ttl),
        }
    }

    /// `None` when the snapshot could not be encoded.
    pub async fn json(&self, viewer_count: usize) -> Option<Arc<str>> {
        self.cell
            .get_async(|| async {
                let snapshot = self.aggregator.collect(viewer_count).await;
                debug!(timestamp = snapshot.timestamp, "http snapshot refreshed");
                encode(&snapshot)
            })
            .await
    }
}

/// Serialize once; the result is shared by every recipient.
pub fn encode(snapshot: &Snapshot) -> Option<Arc<str>> {
    match serde_json::to_string(snapshot) {
        Ok(s) => Some(Arc::from(s)),
        Err(e) => {
            warn!(error = %e, "snapshot encoding failed");
            None
        }
    }
}
