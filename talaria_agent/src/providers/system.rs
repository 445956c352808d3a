use sysinfo::System;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::aggregator::MetricProvider;
use crate::types::SystemMetrics;

/// Host identity (resolved once) plus the clock, uptime and load average.
pub struct SystemInfo {
    hostname: String,
    os_version: String,
    kernel_version: String,
    arch: String,
}

impl SystemInfo {
    pub fn new() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let kernel_version = System::kernel_version().unwrap_or_default();
        let os_version = format!(
            "{} {} ({})",
            System::name().unwrap_or_default(),
            System::os_version().unwrap_or_default(),
            kernel_version
        );
        Self {
            hostname,
            os_version,
            kernel_version,
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// "3 days, 4:05" or "4:05".
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3600;
    let mins = secs % 3600 / 60;
    if days > 0 {
        format!("{days} days, {hours}:{mins:02}")
    } else {
        format!("{hours}:{mins:02}")
    }
}

impl MetricProvider<SystemMetrics> for SystemInfo {
    fn sample(&self) -> anyhow::Result<SystemMetrics> {
        // Local offset lookup fails on some multi-threaded unix setups; UTC then.
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let load = System::load_average();
        Ok(SystemMetrics {
            hostname: self.hostname.clone(),
            os_version: self.os_version.clone(),
            kernel_version: self.kernel_version.clone(),
            uptime: format_uptime(System::uptime()),
            load_avg: format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen),
            current_time: now.format(format_description!("[hour]:[minute]:[second]"))?,
            current_date: now.format(format_description!(
                "[weekday], [day] [month repr:short] [year]"
            ))?,
            arch: self.arch.clone(),
        })
    }
}
