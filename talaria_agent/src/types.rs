//! Data types sent to viewers over WebSocket and HTTP.
//! Keep this module minimal and stable: it defines the wire format.
//!
//! Every category implements `Default`, which doubles as the degraded value
//! reported when its provider times out or fails.

use serde::Serialize;

#[derive(Debug, Serialize, Clone, Default)]
pub struct CpuMetrics {
    pub usage_percent: f32,
    pub core_count: usize,
    pub per_core: Vec<f32>,
    pub model: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub available_mb: u64,
    pub swap_total_mb: u64,
    pub swap_used_mb: u64,
    pub used_percent: f32,
    // "Normal", "Warn", "Critical"; empty when degraded
    pub pressure_level: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct DiskInfo {
    pub filesystem: String,
    pub mount_point: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub used_percent: f64,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct StorageCategory {
    pub name: String,
    pub size_gb: f64,
    pub icon: String,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct StorageBreakdown {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub purgeable_gb: f64,
    pub categories: Vec<StorageCategory>,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct DiskIoMetrics {
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
    pub total_read_bytes: u64,
    pub total_written_bytes: u64,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct InterfaceInfo {
    pub name: String,
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
    // cumulative totals reported by the OS
    pub rx_total: u64,
    pub tx_total: u64,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct NetworkMetrics {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct ProcessRow {
    pub pid: u32,
    pub name: String,
    pub cpu: f32,
    pub mem_mb: f64,
    pub mem_percent: f64,
    pub user: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct SystemMetrics {
    pub hostname: String,
    pub os_version: String,
    pub kernel_version: String,
    pub uptime: String,
    pub load_avg: String,
    pub current_time: String,
    pub current_date: String,
    pub arch: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct ThermalMetrics {
    pub cpu_temp_c: Option<f32>,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct GpuMetrics {
    pub name: String,
    pub utilization_pct: u32, // 0..100
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct ConnectivityMetrics {
    pub active_connections: usize,
    pub listening_ports: usize,
    pub vpn_active: bool,
    pub vpn_interface: String,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    pub process: String,
    pub pid: u32,
    pub protocol: String,
    pub local: String,
    pub remote: String,
    pub state: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct ConnectionDetails {
    pub active: Vec<ConnectionInfo>,
    pub listening: Vec<ConnectionInfo>,
}

/// One consistent bundle of every metric category. Built once per tick and
/// never mutated afterwards.
#[derive(Debug, Serialize, Clone, Default)]
pub struct Snapshot {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskInfo>,
    pub storage_breakdown: StorageBreakdown,
    pub disk_io: DiskIoMetrics,
    pub network: NetworkMetrics,
    pub processes: Vec<ProcessRow>,
    pub system: SystemMetrics,
    pub thermal: ThermalMetrics,
    pub gpu: Option<GpuMetrics>,
    pub connectivity: ConnectivityMetrics,
    pub timestamp: i64,
    pub client_count: usize,
}
