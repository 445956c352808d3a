//! Storage reconciler: one consistent storage breakdown out of up to three
//! independently fallible sources.
//!
//! Sources are tried in priority order and the first usable one wins:
//!
//! 1. a native volume-capacity query (`statvfs`, plus the purgeable figure
//!    where the platform has one),
//! 2. the container-listing tool (`diskutil apfs list`) cross-referenced with
//!    the purgeable figure from `diskutil info`,
//! 3. plain total/free of the OS volume from the disk list.
//!
//! Whatever the source, the figures go through [`decompose`], which splits
//! used space into named categories.

use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::cmd::run_cmd;
use crate::config::StorageConfig;
use crate::types::{DiskInfo, StorageBreakdown, StorageCategory};

/// Unaccounted usage below this many GB is not worth an "Other" slice.
/// Heuristic; tune if dashboards show a noisy Other category.
pub const OTHER_THRESHOLD_GB: f64 = 1.0;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const GB: f64 = 1e9;

/// Capacity of the container behind the data volume, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerFigures {
    pub total: u64,
    /// Free without reclaiming anything.
    pub free: u64,
    /// Reclaimable on demand (snapshots, caches).
    pub purgeable: u64,
}

/// A tier-1 or tier-2 capacity source.
pub trait CapacitySource: Send + Sync {
    fn name(&self) -> &'static str;
    fn query(&self) -> BoxFuture<'_, Option<ContainerFigures>>;
}

/// The per-mount usage list the categories are derived from.
pub trait VolumeSource: Send + Sync {
    fn volumes(&self) -> Vec<DiskInfo>;
}

/// Usage of the two well-known volumes, in GB.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeUsage {
    pub os_used: f64,
    pub data_used: f64,
}

impl VolumeUsage {
    pub fn from_disks(disks: &[DiskInfo], layout: &StorageConfig) -> Self {
        let used_at = |mount: &str| {
            disks
                .iter()
                .find(|d| d.mount_point == mount)
                .map(|d| d.used_gb)
                .unwrap_or(0.0)
        };
        let os_used = used_at(&layout.os_mount);
        // Same mount twice would double count.
        let data_used = if layout.data_mount == layout.os_mount {
            0.0
        } else {
            used_at(&layout.data_mount)
        };
        Self { os_used, data_used }
    }
}

/// Split a container's capacity into named categories. Shared by every tier.
///
/// `free_gb` is the immediately free space and `purgeable_gb` the reclaimable
/// part; both count as free in the result. Categories always add up to
/// `used_gb + free_gb` within [`OTHER_THRESHOLD_GB`] and are never negative.
pub fn decompose(
    total_gb: f64,
    free_gb: f64,
    purgeable_gb: f64,
    usage: VolumeUsage,
) -> StorageBreakdown {
    let total = non_negative(total_gb);
    let purgeable = non_negative(purgeable_gb).min(total);
    let free_basic = non_negative(free_gb).min(total - purgeable);
    let free = free_basic + purgeable;
    let used = non_negative(total - free);

    let mut os = non_negative(usage.os_used);
    let mut data = non_negative(usage.data_used - purgeable);
    // Volumes can report more than the container thinks is in use (shared
    // blocks, snapshots); trim data first, then the OS volume.
    let overshoot = os + data - used;
    if overshoot > 0.0 {
        let from_data = overshoot.min(data);
        data -= from_data;
        os = non_negative(os - (overshoot - from_data));
    }

    let mut categories = Vec::with_capacity(5);
    if os > 0.0 {
        categories.push(category("System", os, "system"));
    }
    if data > 0.0 {
        categories.push(category("Data", data, "apps"));
    }
    let known = os + data;
    if used - known > OTHER_THRESHOLD_GB {
        categories.push(category("Other", used - known, "doc"));
    }
    if purgeable > 0.0 {
        categories.push(category("Purgeable", purgeable, "snapshot"));
    }
    categories.push(category("Free", free_basic, "free"));

    StorageBreakdown {
        total_gb: total,
        used_gb: used,
        free_gb: free,
        purgeable_gb: purgeable,
        categories,
    }
}

fn category(name: &str, size_gb: f64, icon: &str) -> StorageCategory {
    StorageCategory {
        name: name.to_string(),
        size_gb,
        icon: icon.to_string(),
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

struct Cached {
    value: StorageBreakdown,
    updated: Option<Instant>,
    pending: bool,
}

pub struct StorageReconciler {
    sources: Vec<Box<dyn CapacitySource>>,
    volumes: Arc<dyn VolumeSource>,
    layout: StorageConfig,
    state: Mutex<Cached>,
    runtime: Handle,
    interval: Duration,
}

impl StorageReconciler {
    /// `sources` are the capacity tiers in priority order; the volume list is
    /// the final fallback.
    pub fn new(
        sources: Vec<Box<dyn CapacitySource>>,
        volumes: Arc<dyn VolumeSource>,
        layout: StorageConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            sources,
            volumes,
            layout,
            state: Mutex::new(Cached {
                value: StorageBreakdown::default(),
                updated: None,
                pending: false,
            }),
            runtime,
            interval: REFRESH_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The latest breakdown. Kicks off a background refresh when stale; callers
    /// never wait for it.
    pub fn breakdown(self: &Arc<Self>) -> StorageBreakdown {
        let mut state = self.lock();
        let stale = state.updated.map_or(true, |t| t.elapsed() > self.interval);
        if stale && !state.pending {
            state.pending = true;
            let this = Arc::clone(self);
            self.runtime.spawn(async move {
                let pending = PendingGuard(Arc::clone(&this));
                let fresh = this.reconcile().await;
                let mut state = this.lock();
                state.value = fresh;
                state.updated = Some(Instant::now());
                drop(state);
                drop(pending);
            });
        }
        state.value.clone()
    }

    /// Run the tiers once and return the result.
    pub async fn reconcile(&self) -> StorageBreakdown {
        let volumes = Arc::clone(&self.volumes);
        let disks = tokio::task::spawn_blocking(move || volumes.volumes())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "volume listing panicked");
                Vec::new()
            });
        let usage = VolumeUsage::from_disks(&disks, &self.layout);

        for source in &self.sources {
            if let Some(fig) = source.query().await {
                debug!(source = source.name(), ?fig, "storage figures");
                return decompose(
                    fig.total as f64 / GB,
                    fig.free as f64 / GB,
                    fig.purgeable as f64 / GB,
                    usage,
                );
            }
        }

        match disks.iter().find(|d| d.mount_point == self.layout.os_mount) {
            Some(os) => {
                debug!(source = "volume list", "storage figures");
                decompose(os.total_gb, os.free_gb, 0.0, usage)
            }
            None => {
                warn!(mount = %self.layout.os_mount, "no storage source produced data");
                StorageBreakdown::default()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cached> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingGuard(Arc<StorageReconciler>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.lock().pending = false;
    }
}

/// Tier 1: `statvfs(2)` on the volume holding the container's free space.
///
/// `statvfs` only knows the immediately available space. Where the platform
/// can also reclaim purgeable space the figure is taken from `diskutil info`,
/// and without it the tier reports nothing so the next one is asked.
pub struct StatvfsCapacity {
    path: String,
    purgeable_info: Option<String>,
}

impl StatvfsCapacity {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            purgeable_info: None,
        }
    }

    /// Require the purgeable figure of `mount` from `diskutil info`.
    pub fn with_purgeable_info(mut self, mount: impl Into<String>) -> Self {
        self.purgeable_info = Some(mount.into());
        self
    }
}

impl CapacitySource for StatvfsCapacity {
    fn name(&self) -> &'static str {
        "volume capacity"
    }

    fn query(&self) -> BoxFuture<'_, Option<ContainerFigures>> {
        let path = self.path.clone();
        Box::pin(async move {
            let basic = tokio::task::spawn_blocking(move || statvfs(&path))
                .await
                .ok()
                .flatten()?;
            let Some(mount) = &self.purgeable_info else {
                return Some(basic);
            };
            match run_cmd("diskutil", &["info", mount.as_str()], Duration::from_secs(2)).await {
                Ok(info) => with_purgeable(basic, &info),
                Err(e) => {
                    debug!(error = %e, "volume info unavailable");
                    None
                }
            }
        })
    }
}

/// `basic` with its purgeable figure filled in from `diskutil info` output,
/// or `None` when the output carries no such figure.
pub fn with_purgeable(basic: ContainerFigures, info: &str) -> Option<ContainerFigures> {
    let purgeable = parse_purgeable(info)?;
    Some(ContainerFigures {
        purgeable: purgeable.min(basic.total.saturating_sub(basic.free)),
        ..basic
    })
}

/// The mount whose filesystem tier 1 measures. APFS volumes share their
/// container's space, so the data volume stands for it; elsewhere the OS
/// volume is the one the System category is taken from.
pub fn capacity_mount(layout: &StorageConfig) -> &str {
    if cfg!(target_os = "macos") {
        &layout.data_mount
    } else {
        &layout.os_mount
    }
}

/// The capacity tiers for this host, in priority order.
pub fn host_sources(layout: &StorageConfig) -> Vec<Box<dyn CapacitySource>> {
    let mut tier1 = StatvfsCapacity::new(capacity_mount(layout));
    if cfg!(target_os = "macos") {
        tier1 = tier1.with_purgeable_info(layout.data_mount.clone());
    }
    let mut sources: Vec<Box<dyn CapacitySource>> = vec![Box::new(tier1)];
    if cfg!(target_os = "macos") {
        sources.push(Box::new(ContainerListing::new(layout.data_mount.clone())));
    }
    sources
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn statvfs(path: &str) -> Option<ContainerFigures> {
    let c_path = CString::new(path).ok()?;
    // SAFETY: statvfs is plain old data; zeroed is a valid initial state.
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and st is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return None;
    }
    let frsize = st.f_frsize as u64;
    let total = (st.f_blocks as u64).saturating_mul(frsize);
    let free = (st.f_bavail as u64).saturating_mul(frsize);
    (total > 0 && free > 0).then_some(ContainerFigures {
        total,
        free,
        purgeable: 0,
    })
}

#[cfg(not(unix))]
fn statvfs(path: &str) -> Option<ContainerFigures> {
    let _ = CString::new(path);
    None
}

/// Tier 2: `diskutil apfs list` plus the purgeable figure from `diskutil info`.
pub struct ContainerListing {
    data_mount: String,
}

impl ContainerListing {
    pub fn new(data_mount: impl Into<String>) -> Self {
        Self {
            data_mount: data_mount.into(),
        }
    }
}

impl CapacitySource for ContainerListing {
    fn name(&self) -> &'static str {
        "container listing"
    }

    fn query(&self) -> BoxFuture<'_, Option<ContainerFigures>> {
        Box::pin(async move {
            let listing = match run_cmd("diskutil", &["apfs", "list"], Duration::from_secs(3)).await {
                Ok(out) => out,
                Err(e) => {
                    debug!(error = %e, "container listing unavailable");
                    return None;
                }
            };
            let mut fig = parse_container_listing(&listing)?;
            match run_cmd(
                "diskutil",
                &["info", self.data_mount.as_str()],
                Duration::from_secs(2),
            )
            .await
            {
                Ok(info) => fig.purgeable = parse_purgeable(&info).unwrap_or(0),
                Err(e) => debug!(error = %e, "volume info unavailable"),
            }
            Some(fig)
        })
    }
}

static BYTES_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) B \(").expect("static regex"));
static PURGEABLE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Volume Purgeable Space:[\s\S]*?(\d+) Bytes").expect("static regex"));

/// Figures of the container holding the root volume, or of the first
/// container when no root mount is listed. `purgeable` is left at 0.
pub fn parse_container_listing(text: &str) -> Option<ContainerFigures> {
    let mut containers: Vec<(ContainerFigures, bool)> = Vec::new();

    for line in text.lines() {
        let l = line.trim();
        if l.starts_with("+-- Container disk") {
            containers.push((
                ContainerFigures {
                    total: 0,
                    free: 0,
                    purgeable: 0,
                },
                false,
            ));
            continue;
        }
        let Some((fig, has_root)) = containers.last_mut() else {
            continue;
        };
        if let Some(caps) = BYTES_FIELD.captures(l) {
            let value: u64 = caps[1].parse().unwrap_or(0);
            if l.contains("Size (Capacity Ceiling)") {
                fig.total = value;
            } else if l.contains("Capacity Not Allocated") {
                fig.free = value;
            }
        } else if l.contains("Mount Point:") && l.split_whitespace().any(|f| f == "/") {
            *has_root = true;
        }
    }

    containers
        .iter()
        .find(|(_, root)| *root)
        .or_else(|| containers.first())
        .map(|(fig, _)| *fig)
        .filter(|fig| fig.total > 0)
}

pub fn parse_purgeable(text: &str) -> Option<u64> {
    PURGEABLE_FIELD
        .captures(text)
        .and_then(|c| c[1].parse().ok())
}
